#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("celld only works on linux or android");

#[cfg(test)] mod tests;

pub mod fdpass;
pub mod reply;

mod types;
mod wire;

pub use types::*;
pub use wire::*;
