//! HTTP plumbing: header construction and the injectable transport.

pub mod headers;
pub mod transport;

pub use headers::HttpHeaderBuilder;
pub use transport::{
    FilePart, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, RequestBody,
    TransportError, TransportErrorKind,
};
