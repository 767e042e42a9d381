pub use anyhow;
pub use glam;

mod acceleration_structure;
mod backend;
mod config;
mod descriptor;
mod error;
mod pipeline;
mod renderer;
mod scene;
mod shader_table;
mod sync;

pub mod gpu;
pub mod utils;

pub use acceleration_structure::*;
pub use backend::*;
pub use config::*;
pub use descriptor::*;
pub use error::*;
pub use pipeline::*;
pub use renderer::*;
pub use scene::*;
pub use shader_table::*;
pub use sync::*;
