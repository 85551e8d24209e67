use std::{env, io::Write};

use squeeze::{Compress, CompressionLevel, Request, ResponseWriter, Server, StatusCode};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn main() -> std::io::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let level = match env::var("LEVEL") {
        Ok(level) => level.parse().expect("Invalid LEVEL value"),
        Err(_) => CompressionLevel::BestSpeed,
    };

    let app = |res: &mut dyn ResponseWriter, _req: &Request<Vec<u8>>| {
        res.set_status(StatusCode::OK);
        res.headers_mut()
            .insert("content-type", "text/plain".parse().unwrap());
        res.write_all(include_bytes!("./compress.rs")).ok();
    };

    let app = Compress::new(app, level).expect("Invalid compression level");

    Server::bind("0.0.0.0:4444").serve(app)
}
