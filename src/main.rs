// Image layer store serving pushes and pulls over http, backed by a local
// directory or an s3 bucket.
use docopt::Docopt;

use layerstore::config::{Args, Config, USAGE};
use layerstore::http::{self, AppState};

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    let config = Config::from_args(args)?;

    // the s3 client does blocking io, it is built and dropped outside the
    // runtime
    let store = config.open_store()?;
    let state = AppState::new(store.clone(), config.pending_ttl);

    let served = actix_web::rt::System::new().block_on(http::serve(state, &config.bind));
    drop(store);
    served
}
