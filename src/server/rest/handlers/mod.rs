pub mod containers;
pub mod events;
pub mod system;
