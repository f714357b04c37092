//! Bibliothèque de modules réutilisables

pub mod bitmap;

pub use bitmap::Bitmap;
