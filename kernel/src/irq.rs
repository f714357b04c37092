//! CPU interrupt masking and interrupt-safe spinlocks
//!
//! The architecture layer installs its local interrupt save/restore pair once
//! at boot with [`install_irq_ops`]. Until then (and on the host) masking is a
//! no-op. Every kernel spinlock is an [`IrqSpinLock`]: taking it masks local
//! interrupts, dropping the guard releases the lock first and restores the
//! saved interrupt state last.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use spin::Once;

/// Saved interrupt state, opaque to the kernel
pub type IrqFlags = usize;

/// Local CPU interrupt save/restore primitives
#[derive(Clone, Copy)]
pub struct IrqOps {
    /// Disable local interrupts and return the previous state
    pub save: fn() -> IrqFlags,
    /// Restore a state returned by `save`
    pub restore: fn(IrqFlags),
}

static IRQ_OPS: Once<IrqOps> = Once::new();

/// Install the architecture's interrupt primitives. Only the first call wins.
pub fn install_irq_ops(ops: IrqOps) {
    IRQ_OPS.call_once(|| ops);
}

#[inline]
pub fn local_irq_save() -> IrqFlags {
    match IRQ_OPS.get() {
        Some(ops) => (ops.save)(),
        None => 0,
    }
}

#[inline]
pub fn local_irq_restore(flags: IrqFlags) {
    if let Some(ops) = IRQ_OPS.get() {
        (ops.restore)(flags);
    }
}

/// Interrupts masked for the lifetime of the guard
pub struct IrqGuard {
    flags: IrqFlags,
}

impl IrqGuard {
    pub fn save() -> Self {
        Self { flags: local_irq_save() }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        local_irq_restore(self.flags);
    }
}

/// Spinlock taken with local interrupts masked
pub struct IrqSpinLock<T: ?Sized> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> IrqSpinLock<T> {
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let flags = local_irq_save();
        IrqSpinLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            flags,
        }
    }

    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let flags = local_irq_save();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSpinLockGuard {
                guard: ManuallyDrop::new(guard),
                flags,
            }),
            None => {
                local_irq_restore(flags);
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: Default> Default for IrqSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct IrqSpinLockGuard<'a, T: ?Sized + 'a> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    flags: IrqFlags,
}

impl<'a, T: ?Sized> Deref for IrqSpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T: ?Sized> DerefMut for IrqSpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T: ?Sized> Drop for IrqSpinLockGuard<'a, T> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here, before the
        // interrupt state is restored.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        local_irq_restore(self.flags);
    }
}
