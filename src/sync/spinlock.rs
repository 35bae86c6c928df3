//! Interrupt-masking spinlock: the kernel's critical section.
//!
//! Locking masks interrupts through the port first and then takes the spin
//! mutex, so an interrupt handler on the same core can never spin on a lock
//! its own core holds. The guard releases in the opposite order.

use crate::arch::Port;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

/// Spinlock that also masks interrupts while held.
pub struct IrqSpinLock<A: Port, T> {
    inner: spin::Mutex<T>,
    _port: PhantomData<fn() -> A>,
}

impl<A: Port, T> IrqSpinLock<A, T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
            _port: PhantomData,
        }
    }

    /// Mask interrupts and acquire the lock.
    pub fn lock(&self) -> IrqSpinGuard<'_, A, T> {
        let irq_state = A::irq_lock();
        let guard = self.inner.lock();
        IrqSpinGuard {
            guard: ManuallyDrop::new(guard),
            irq_state,
            _port: PhantomData,
        }
    }

    /// Acquire without spinning; interrupts are left untouched on failure.
    pub fn try_lock(&self) -> Option<IrqSpinGuard<'_, A, T>> {
        let irq_state = A::irq_lock();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSpinGuard {
                guard: ManuallyDrop::new(guard),
                irq_state,
                _port: PhantomData,
            }),
            None => {
                A::irq_unlock(irq_state);
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Guard of an [`IrqSpinLock`].
pub struct IrqSpinGuard<'a, A: Port, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    irq_state: usize,
    _port: PhantomData<fn() -> A>,
}

impl<A: Port, T> Deref for IrqSpinGuard<'_, A, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<A: Port, T> DerefMut for IrqSpinGuard<'_, A, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<A: Port, T> Drop for IrqSpinGuard<'_, A, T> {
    fn drop(&mut self) {
        // Spin lock first, interrupt mask last.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        A::irq_unlock(self.irq_state);
    }
}
