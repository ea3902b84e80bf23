// SPDX-License-Identifier: MIT

use std::env::args;
use std::process::exit;

use anyhow::{bail, Error};

use wsupp::Daemon;

/// Exactly one positional argument: the wireless interface to manage.
fn parse_args() -> Result<String, Error> {
    let mut argv = args().skip(1);
    let Some(name) = argv.next() else {
        bail!("too few arguments");
    };
    if argv.next().is_some() {
        bail!("too many arguments");
    }
    Ok(name)
}

async fn supplicant(ifname: &str) -> Result<(), Error> {
    let mut daemon = Daemon::new(ifname).await?;
    daemon.run().await?;
    Ok(())
}

fn main() {
    env_logger::init();

    let result = parse_args().and_then(|ifname| {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        rt.block_on(supplicant(&ifname))
    });

    if let Err(e) = result {
        eprintln!("wifi: {e}");
        exit(0xFF);
    }
}
