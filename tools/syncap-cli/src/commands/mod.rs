pub mod record;
pub mod stop;
pub mod verify;
