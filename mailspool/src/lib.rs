pub mod controller;

pub use controller::Mailspool;
