pub mod clean;
pub mod metadata;
pub mod submit;
pub mod work;
