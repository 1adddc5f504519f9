//! Periodic keepalive
//!
//! Each tick retries NAT reflection until classified, sweeps expired
//! packets out of the cache (re-announcing each one last time), ages the
//! query dedup table, drops idle cluster peers, decays rate limiter credit
//! and pings every remaining peer.

use crate::engine::{Peer, Task};
use crate::network::limiter::DECAY_FACTOR;
use crate::network::packet::Probe;

impl Peer {
    pub(crate) fn heartbeat(&mut self) {
        if self.is_closing() {
            return;
        }
        let now = self.now();

        if !self.config.introducer && !self.nat_type.is_known() {
            self.request_reflection();
        }

        self.hooks.on_interval();
        self.sweep_expired(now);

        self.queries.retain(|_, ticks| {
            *ticks = ticks.saturating_sub(1);
            *ticks > 0
        });

        let keepalive = self.config.keepalive;
        let before = self.peers.len();
        self.peers.retain(|p| {
            p.cluster_id.is_none() || now.saturating_sub(p.last_update) < keepalive
        });
        if self.peers.len() < before {
            log::debug!("Dropped {} idle peers", before - self.peers.len());
        }

        let peers: Vec<_> = self.peers.iter().cloned().collect();
        for peer in &peers {
            self.limits.decay(&peer.address, DECAY_FACTOR);

            let probe = Probe {
                peer_id: self.peer_id.clone(),
                nat_type: Some(self.nat_type).filter(|n| n.is_known()),
                cluster_id: self.cluster_id.clone(),
                cache_size: Some(self.cache.len()),
                is_heartbeat: true,
                ..Default::default()
            };
            if let Err(e) = self.ping(peer, probe) {
                self.hooks.on_error(&e);
            }
        }

        self.timers.schedule(now + keepalive, Task::Heartbeat);
    }

    /// Evict every packet past its TTL, multicasting it once more first
    fn sweep_expired(&mut self, now: u64) {
        let ttl = self.config.packet_ttl;
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, p)| p.timestamp.saturating_add(ttl) < now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            let Some(packet) = self.cache.delete(&id) else {
                continue;
            };
            if let Err(e) = self.mcast(&packet, Vec::new(), true) {
                self.hooks.on_error(&e);
            }
            self.hooks.on_delete(&packet);
        }
    }
}
