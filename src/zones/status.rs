//! The status pseudo-zone.
//!
//! Not delegated anywhere; answers TXT at its apex with one record per
//! status line. Handy for a quick `dig txt status.` against the server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::names::equal_names;
use crate::response::{records, Rr};
use crate::store::TtlStore;
use crate::zones::dnscheck::watch::WatcherHub;
use crate::zones::Question;
use domain::base::iana::Rtype;

pub struct Generator {
    boot: Instant,
    pub requests: Arc<AtomicU64>,
    pub challenge_store: Arc<TtlStore>,
    pub watchers: Arc<WatcherHub>,
}

impl Generator {
    pub fn new(
        requests: Arc<AtomicU64>,
        challenge_store: Arc<TtlStore>,
        watchers: Arc<WatcherHub>,
    ) -> Self {
        Self {
            boot: Instant::now(),
            requests,
            challenge_store,
            watchers,
        }
    }

    fn status_lines(&self) -> Vec<String> {
        vec![
            format!("uptime: {}s", self.boot.elapsed().as_secs()),
            format!("requests: {}", self.requests.load(Ordering::Relaxed)),
            format!("challenges: {}", self.challenge_store.size()),
            format!("watchers: {}", self.watchers.len()),
        ]
    }

    pub fn generate(&self, q: &Question<'_>, zone: &str) -> (Vec<Rr>, bool) {
        let mut rrs = Vec::new();
        if !equal_names(q.name, zone) {
            return (rrs, false);
        }
        if q.qtype == Rtype::TXT {
            for line in self.status_lines() {
                rrs.push(records::txt(q.name, 1, &line));
            }
        }
        (rrs, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apex_txt_reports_counters() {
        let generator = Generator::new(
            Arc::new(AtomicU64::new(41)),
            Arc::new(TtlStore::new()),
            Arc::new(WatcherHub::new(100)),
        );
        let (rrs, valid) = generator.generate(
            &Question {
                name: "status.",
                qtype: Rtype::TXT,
            },
            "status.",
        );
        assert!(valid);
        assert_eq!(rrs.len(), 4);

        let (rrs, valid) = generator.generate(
            &Question {
                name: "sub.status.",
                qtype: Rtype::TXT,
            },
            "status.",
        );
        assert!(!valid);
        assert!(rrs.is_empty());
    }
}
