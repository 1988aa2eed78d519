//! Common test utilities.

pub mod audit;
pub mod backend;
pub mod server;

#[allow(unused_imports)]
pub use audit::*;
#[allow(unused_imports)]
pub use backend::*;
#[allow(unused_imports)]
pub use server::*;
