//! Bundled provider adapters.

pub mod alpha_vantage;
pub mod polygon;
pub mod yahoo;

pub use alpha_vantage::AlphaVantageAdapter;
pub use polygon::PolygonAdapter;
pub use yahoo::YahooAdapter;
