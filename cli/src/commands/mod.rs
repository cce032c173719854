pub mod dump;
pub mod up;
