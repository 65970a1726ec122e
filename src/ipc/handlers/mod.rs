pub mod extension;
pub mod role;
pub mod tunnel;
