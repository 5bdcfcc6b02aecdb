pub mod action;
pub mod camera;
pub mod detection;
pub mod errors;
pub mod frame;
pub mod inspection;
pub mod model;
pub mod stream;
