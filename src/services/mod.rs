pub mod convert;

pub use convert::{Conversion, RateResolver, BASE_CURRENCY};
