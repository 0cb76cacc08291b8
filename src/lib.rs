//! KinoNest catalog sync: resolve TMDB titles to Kinopoisk ids across several
//! unreliable sources, merge ratings, and store each title exactly once.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod feed;
pub mod media;
pub mod pipeline;
pub mod ratings;
pub mod resolve;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod tracing;
pub mod writer;

pub mod util {
    pub mod db;
    pub mod env;
}
