pub mod host;
pub mod power;
pub mod printer;
pub mod relay;
pub mod scheduler;
pub mod sim;
pub mod timer;
