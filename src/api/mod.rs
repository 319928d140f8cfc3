pub mod cache;
pub mod client;
pub mod error;
pub mod interceptor;
pub mod session;
pub mod transport;

pub use cache::FetchCache;
pub use client::{FetchClient, FetchResult, Fetched, RequestConfig, Resolve};
pub use error::{FetchError, TransportError};
pub use interceptor::{ErrorInterceptor, Notice};
pub use session::Session;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, Transport};
