//! Dispatch engine: the reservation gate and the dispatcher built on it.

pub mod dispatcher;
pub mod reservation;

pub use dispatcher::{Dispatcher, DispatcherBuilder, Submission};
pub use reservation::{Reservation, ReservationSet};
