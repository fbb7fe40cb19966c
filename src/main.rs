// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! Backend process for virtio devices served over a shared memory region.

use std::path::PathBuf;
use std::process;
use std::thread;

use clap::{Arg, Command};
use log::{error, info};
use signal_hook::consts::{SIGHUP, SIGINT};
use signal_hook::iterator::Signals;
use thiserror::Error;
use vos_device::rng::Rng;
use vos_device::shmem::{infer_driver, IvshmemDriver, MmapDriver, ShmemDriver};
use vos_device::transport::ShmemTransport;
use vos_device::{EpollHelperError, TransportError, VosDevice};

#[derive(Debug, Error)]
enum Error {
    #[error("cannot infer a shared memory driver for {0}; pass --driver")]
    UnknownDriver(String),
    #[error("unknown shared memory driver name {0}")]
    BadDriverName(String),
    #[error("unknown device type {0}")]
    BadDeviceName(String),
    #[error("invalid backend id {0}")]
    BadBackendId(String),
    #[error("cannot open the entropy source")]
    OpenEntropySource(#[source] std::io::Error),
    #[error("failed to initialize the transport")]
    Transport(#[source] TransportError),
    #[error("failed to register signal handlers")]
    Signals(#[source] std::io::Error),
    #[error("failed to clone the shutdown eventfd")]
    CloneKillEvt(#[source] std::io::Error),
    #[error("dispatch loop failed")]
    Run(#[source] EpollHelperError),
}

fn create_app() -> Command {
    Command::new("vos-backend")
        .about("Run a virtio device backend over a shared memory region")
        .arg(
            Arg::new("driver")
                .long("driver")
                .short('d')
                .help("Shared memory driver name (ivshmem, mmap)"),
        )
        .arg(
            Arg::new("device")
                .long("device")
                .default_value("rng")
                .help("Virtio device to serve"),
        )
        .arg(
            Arg::new("backend-id")
                .long("backend-id")
                .default_value("0")
                .help("Peer id announced when the driver cannot discover one"),
        )
        .arg(
            Arg::new("shmem-path")
                .required(true)
                .help("Shared memory device path"),
        )
}

fn select_driver(
    name: Option<&str>,
    path: &PathBuf,
    backend_id: u16,
) -> Result<Box<dyn ShmemDriver>, Error> {
    match name {
        Some("ivshmem") => Ok(Box::new(IvshmemDriver::new())),
        Some("mmap") => Ok(Box::new(MmapDriver::new(backend_id))),
        Some(other) => Err(Error::BadDriverName(other.to_string())),
        None => {
            infer_driver(path).ok_or_else(|| Error::UnknownDriver(path.display().to_string()))
        }
    }
}

fn select_device(name: &str) -> Result<Box<dyn VosDevice>, Error> {
    match name {
        "rng" => Ok(Box::new(
            Rng::new("/dev/urandom").map_err(Error::OpenEntropySource)?,
        )),
        other => Err(Error::BadDeviceName(other.to_string())),
    }
}

fn vos_backend() -> Result<(), Error> {
    let matches = create_app().get_matches();

    let path = PathBuf::from(matches.get_one::<String>("shmem-path").unwrap());
    let backend_id = matches.get_one::<String>("backend-id").unwrap();
    let backend_id = backend_id
        .parse::<u16>()
        .map_err(|_| Error::BadBackendId(backend_id.clone()))?;

    let driver = select_driver(
        matches.get_one::<String>("driver").map(String::as_str),
        &path,
        backend_id,
    )?;
    let device = select_device(matches.get_one::<String>("device").unwrap())?;

    let mut transport =
        ShmemTransport::new(driver, &path, device).map_err(Error::Transport)?;

    let kill_evt = transport.kill_evt().map_err(Error::CloneKillEvt)?;
    let mut signals = Signals::new([SIGHUP, SIGINT]).map_err(Error::Signals)?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("received signal {signal}, requesting shutdown");
                if let Err(e) = kill_evt.write(1) {
                    error!("failed to request shutdown: {e}");
                }
            }
        })
        .map_err(Error::Signals)?;

    transport.run().map_err(Error::Run)?;
    transport.shutdown();

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = vos_backend() {
        error!("{e}");
        process::exit(1);
    }
}
