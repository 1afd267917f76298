#[macro_use]
extern crate tracing;

pub mod gc;
pub mod obj_files;
pub mod status;
pub mod upsync;
