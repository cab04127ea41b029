//! Local IP probes: the "UDP connect trick". Opening a UDP socket to a
//! well-known public address and reading back the address the kernel
//! picked for the route reveals the local interface IP without sending
//! any bytes on the wire.

use super::Probe;
use async_trait::async_trait;
use overseer_core::{sensor_names, Clock, SensorReading};
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;

pub struct LocalIpProbe<C: Clock> {
    name: &'static str,
    bind_addr: &'static str,
    target_addr: &'static str,
    clock: C,
}

impl<C: Clock> LocalIpProbe<C> {
    pub fn v4(clock: C) -> Self {
        Self { name: sensor_names::LOCAL_IPV4, bind_addr: "0.0.0.0:0", target_addr: "1.1.1.1:443", clock }
    }

    pub fn v6(clock: C) -> Self {
        Self { name: sensor_names::LOCAL_IPV6, bind_addr: "[::]:0", target_addr: "[2606:4700:4700::1111]:443", clock }
    }
}

#[async_trait]
impl<C: Clock> Probe for LocalIpProbe<C> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn check(&self) -> SensorReading {
        match local_address(self.bind_addr, self.target_addr).await {
            Ok(ip) => SensorReading::ip(self.name, ip, self.clock.now()),
            Err(e) => SensorReading::error(self.name, e.to_string(), self.clock.now()),
        }
    }
}

async fn local_address(bind_addr: &str, target_addr: &str) -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind(bind_addr).await?;
    let target: SocketAddr = target_addr.parse().map_err(|_| std::io::Error::other("bad target address"))?;
    socket.connect(target).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::FakeClock;

    #[tokio::test]
    async fn v4_probe_reports_some_local_address() {
        let probe = LocalIpProbe::v4(FakeClock::new());
        let reading = probe.check().await;
        assert!(reading.ip.is_some() || reading.error.is_some());
    }
}
