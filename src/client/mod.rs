//! Upload client: transfer worker, sequential queue and gallery.

pub mod api;
pub mod gallery;
pub mod manager;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod testing;
