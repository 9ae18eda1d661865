//! Echo service: the smallest useful business surface, used by the demo
//! binary and the integration tests.

use bytes::Bytes;

use crate::registry::{handler, Request, Response, ServiceInfo};

/// `echo.echo` returns the payload unchanged; `echo.reverse` returns the
/// payload bytes reversed.
pub fn service() -> ServiceInfo {
    ServiceInfo::new("echo")
        .method(
            "echo",
            handler(|req: Request| async move { Ok(Response::ok(req.data)) }),
        )
        .method(
            "reverse",
            handler(|req: Request| async move {
                let mut out = req.data.to_vec();
                out.reverse();
                Ok(Response::ok(Bytes::from(out)))
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crosswire_core::protocol::codec::WireCodec;

    #[tokio::test]
    async fn echo_and_reverse() {
        let reg = Registry::new(Vec::new(), None);
        reg.register(service()).unwrap();

        let req = Request {
            conn_id: 0,
            service: "echo".into(),
            method: "echo".into(),
            codec: WireCodec::Json,
            data: Bytes::from_static(b"abc"),
            metas: Vec::new(),
        };
        let resp = reg.dispatch(req.clone()).await.unwrap();
        assert_eq!(&resp.data[..], b"abc");

        let mut rev = req;
        rev.method = "reverse".into();
        let resp = reg.dispatch(rev).await.unwrap();
        assert_eq!(&resp.data[..], b"cba");
    }
}
