pub mod proxy {
    tonic::include_proto!("kvbuf.proxy");
}

pub use proxy::{Errno, Request, Response};
