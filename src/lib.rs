pub mod broute;
pub mod channel;
pub mod echonetlite;
pub mod fault;
pub mod reading;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod skstack;
pub mod transport;

pub use broute::*;
pub use reading::*;
pub use settings::*;
pub use transport::*;
