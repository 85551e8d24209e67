use std::io::Write;

use squeeze::{Compress, Method, Request, ResponseWriter, Server, StatusCode};

fn app(res: &mut dyn ResponseWriter, req: &Request<Vec<u8>>) {
    let body = match (req.method(), req.uri().path()) {
        (_, "/") => b"Usage: curl --compressed -d hello localhost:4444/echo\n".to_vec(),

        // Responds with the same payload
        (&Method::POST, "/echo") => req.body().clone(),

        // A body big enough to be worth compressing
        (&Method::GET, "/big") => "All work and no play makes Jack a dull boy.\n"
            .repeat(100)
            .into_bytes(),

        _ => {
            res.set_status(StatusCode::NOT_FOUND);
            Vec::new()
        }
    };

    res.write_all(&body).ok();
}

fn main() -> std::io::Result<()> {
    let app = Compress::builder()
        .min_length(squeeze::DEFAULT_MIN_LENGTH)
        .build(app)
        .expect("valid compression level");

    Server::builder()
        .max_threads(16)
        .bind("0.0.0.0:4444")
        .serve(app)
}
