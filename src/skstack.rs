pub mod authn;
pub mod command;
pub mod parser;
pub mod skrxd;

pub use command::*;
pub use skrxd::*;
