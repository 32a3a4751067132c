pub mod event_repository;
pub mod streamer_repository;

pub use event_repository::EventRepository;
pub use streamer_repository::StreamerRepository;
