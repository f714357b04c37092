// src/lib.rs
// Point d'entrée de la bibliothèque du noyau temps réel
#![cfg_attr(not(test), no_std)]

// Import de alloc pour les allocations dynamiques
extern crate alloc;

#[macro_use]
pub mod error;

pub mod config;
pub mod logger;
pub mod irq;
pub mod port;
pub mod libutils;
pub mod wq;
pub mod time;
pub mod scheduler;
pub mod sync;

#[doc(hidden)]
pub use log as __log;

pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use port::{CpuId, Port};
pub use scheduler::{Context, Kernel, Scheduler, Thread, ThreadAttr, ThreadId, ThreadState};
pub use time::Tick;
