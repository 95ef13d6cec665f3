pub mod hashing;
pub mod single_flight;

pub use hashing::HashingService;
pub use single_flight::SingleFlight;
