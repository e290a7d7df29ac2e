//! Reservations: the time-limited, idempotent purchase right a round winner
//! holds between winning and paying.

pub mod manager;
pub mod sweep_loop;

pub use {
    manager::{CancelError, ReservationManager, ReserveError, WinnerInfo},
    sweep_loop::SweepLoop,
};
