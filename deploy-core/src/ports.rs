//! Port Allocator (C2): finds a free TCP port on local and remote hosts
//! within a configured range.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::CapacityError;
use crate::shell::Shell;

/// Short-timeout TCP connect probe, per spec §4.2.
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

pub struct PortAllocator {
    pub start: u16,
    pub end: u16,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Iterates the range; a refused connect denotes "free". Returns the
    /// first free port.
    pub async fn find_local(&self) -> Result<u16, CapacityError> {
        for port in self.start..=self.end {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
            let connect = tokio::net::TcpStream::connect(addr);
            match tokio::time::timeout(PROBE_TIMEOUT, connect).await {
                Ok(Ok(_stream)) => continue, // something is listening
                Ok(Err(_)) | Err(_) => return Ok(port), // refused or timed out: free
            }
        }
        Err(CapacityError::NoFreePort {
            where_: "local",
            start: self.start,
            end: self.end,
        })
    }

    /// Runs a listen-table query over the shell for each port in range; a
    /// port is free iff the query produces empty output. Query errors are
    /// treated as "not free" — safety first, per spec §4.2.
    pub async fn find_remote(&self, shell: &dyn Shell) -> Result<u16, CapacityError> {
        for port in self.start..=self.end {
            let cmd = format!(
                "(ss -Hltn 2>/dev/null || netstat -ltn 2>/dev/null) | awk '{{print $4}}' | grep -E \":{port}$\""
            );
            match shell.exec(&cmd).await {
                Ok(out) if out.stdout.trim().is_empty() => return Ok(port),
                _ => continue,
            }
        }
        Err(CapacityError::NoFreePort {
            where_: "remote",
            start: self.start,
            end: self.end,
        })
    }

    /// Returns `{local, remote}`. The remote search begins at `local + 1`
    /// (wrapping to `start` at the high end of the range) so the pair is
    /// reproducibly distinct, per spec §4.2.
    pub async fn allocate_pair(
        &self,
        shell: &dyn Shell,
    ) -> Result<super::model::PortLease, CapacityError> {
        let local = self.find_local().await?;
        let remote_search_start = if local >= self.end {
            self.start
        } else {
            local + 1
        };
        let remote_allocator = PortAllocator {
            start: remote_search_start,
            end: self.end,
        };
        let remote = match remote_allocator.find_remote(shell).await {
            Ok(p) => p,
            Err(_) if remote_search_start != self.start => {
                // wrap around once to cover the low end of the range too
                PortAllocator {
                    start: self.start,
                    end: remote_search_start.saturating_sub(1).max(self.start),
                }
                .find_remote(shell)
                .await?
            }
            Err(e) => return Err(e),
        };

        Ok(super::model::PortLease {
            local_port: local,
            remote_port: remote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_local_over_fully_occupied_range_returns_no_free_port() {
        // Bind the single port in a 1-wide range so it is definitely occupied.
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let allocator = PortAllocator::new(port, port);
        let result = allocator.find_local().await;
        assert!(matches!(result, Err(CapacityError::NoFreePort { .. })));
    }

    #[tokio::test]
    async fn find_local_returns_a_port_within_range() {
        let allocator = PortAllocator::new(20000, 20100);
        let port = allocator.find_local().await.unwrap();
        assert!((20000..=20100).contains(&port));
    }
}
