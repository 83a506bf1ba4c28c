pub mod config;
pub mod diagram;
pub mod extract;
pub mod model;
pub mod refine;
pub mod server;
pub mod studio;
#[doc(hidden)]
pub mod test_support;
