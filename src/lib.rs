mod config;
pub mod disk;
mod dispenser;
mod error;
mod forward;
pub mod memory;
mod server;
pub mod stream;
mod traits;
mod upload_file;
mod validation;

pub use config::*;
pub use dispenser::*;
pub use error::*;
pub use forward::*;
pub use server::*;
pub use traits::*;
pub use upload_file::*;
pub use validation::*;
