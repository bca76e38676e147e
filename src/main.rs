use tracing::{error, info_span, Level};

use riffle::server::Service;
use riffle::{init_settings, init_tracing};

fn main() {
    init_tracing(Level::DEBUG);

    let _span = info_span!("startup").entered();

    let conf = init_settings().expect("could not load config");

    let service = Service::new(conf.listen_address());
    if let Err(e) = service.run(conf) {
        error!(error = %e, "service failed");
        std::process::exit(1);
    }
}
