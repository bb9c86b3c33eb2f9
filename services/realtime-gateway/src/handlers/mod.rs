pub mod health;
pub mod ops;
pub mod stream;
pub mod ticks;
pub mod webhook;
