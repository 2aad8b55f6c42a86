pub mod memory;
pub mod postgres;
pub mod repository;

pub use memory::MemoryRepository;
pub use postgres::PostgresRepository;
pub use repository::CandleRepository;
