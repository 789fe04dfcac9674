use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::select;
use tokio::time;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::collaborators::AddressBook;
use crate::collaborators::Nat;
use crate::macros::fn_name;
use crate::macros::log_slow_scope;
use crate::models::peer::NetAddress;
use crate::models::peer::ServiceFlags;

const MAPPING_PROTOCOL: &str = "tcp";
const MAPPING_DESCRIPTION: &str = "pod listen port";
const MAPPING_LEASE: Duration = Duration::from_secs(20 * 60);

/// The lease is renewed well before it runs out.
const RENEWAL_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Keeps a port mapping for the listen port alive on the local NAT device
/// and tells the address book about the external address once.
pub struct UpnpHandler {
    nat: Arc<dyn Nat>,
    address_book: Arc<dyn AddressBook>,
    port: u16,
    services: ServiceFlags,
    quit: CancellationToken,
}

impl std::fmt::Debug for UpnpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpnpHandler")
            .field("port", &self.port)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

impl UpnpHandler {
    pub fn new(
        nat: Arc<dyn Nat>,
        address_book: Arc<dyn AddressBook>,
        port: u16,
        services: ServiceFlags,
        quit: CancellationToken,
    ) -> Self {
        Self {
            nat,
            address_book,
            port,
            services,
            quit,
        }
    }

    /// Map the port. Returns whether the external address got advertised.
    async fn renew(&self, advertise: bool) -> bool {
        log_slow_scope!(fn_name!());

        let mapped_port = match self
            .nat
            .add_port_mapping(
                MAPPING_PROTOCOL,
                self.port,
                self.port,
                MAPPING_DESCRIPTION,
                MAPPING_LEASE,
            )
            .await
        {
            Ok(port) => port,
            Err(err) => {
                warn!("can't add UPnP port mapping: {err}");
                return false;
            }
        };

        if !advertise {
            return false;
        }

        let external_ip = match self.nat.external_address().await {
            Ok(ip) => ip,
            Err(err) => {
                warn!("UPnP can't get external address: {err}");
                return false;
            }
        };

        let address = NetAddress::new(SocketAddr::new(external_ip, mapped_port), self.services);
        if let Err(err) = self.address_book.add_local_address(address) {
            warn!("Failed to add UPnP local address {}: {err}", address.addr);
            return false;
        }

        warn!("Successfully bound via UPnP to {}", address.addr);
        true
    }

    pub async fn run(self) -> Result<()> {
        let mut advertised = false;
        let timer = time::sleep(Duration::ZERO);
        tokio::pin!(timer);

        loop {
            select! {
                _ = self.quit.cancelled() => {
                    break;
                }

                _ = &mut timer => {
                    if self.renew(!advertised).await {
                        advertised = true;
                    }
                    timer.as_mut().reset(Instant::now() + RENEWAL_INTERVAL);
                }
            }
        }

        match self
            .nat
            .delete_port_mapping(MAPPING_PROTOCOL, self.port, self.port)
            .await
        {
            Ok(()) => debug!("successfully disestablished UPnP port mapping"),
            Err(err) => warn!("unable to remove UPnP port mapping: {err}"),
        }

        Ok(())
    }
}
