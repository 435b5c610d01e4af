//! Ranking of probed peers.

use reqwest::Url;
use std::time::Duration;

/// Result of probing one peer's `/info`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerProbe {
    pub url: Url,
    pub height: u64,
    pub latency: Duration,
}

/// Order peers by height descending, then latency ascending.
///
/// The URL breaks remaining ties so identical inputs always rank identically.
pub fn rank_peers(mut probes: Vec<PeerProbe>) -> Vec<Url> {
    probes.sort_by(|a, b| {
        b.height
            .cmp(&a.height)
            .then(a.latency.cmp(&b.latency))
            .then_with(|| a.url.as_str().cmp(b.url.as_str()))
    });
    probes.into_iter().map(|p| p.url).collect()
}

/// Drop peers lagging more than `max_height_lag` behind the best one,
/// rank the rest and keep at most `max_peers`.
pub fn select_peers(probes: Vec<PeerProbe>, max_height_lag: u64, max_peers: usize) -> Vec<Url> {
    let Some(best) = probes.iter().map(|p| p.height).max() else {
        return Vec::new();
    };
    let fresh = probes
        .into_iter()
        .filter(|p| p.height.saturating_add(max_height_lag) >= best)
        .collect();
    let mut ranked = rank_peers(fresh);
    ranked.truncate(max_peers);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(host: &str, height: u64, latency_ms: u64) -> PeerProbe {
        PeerProbe {
            url: Url::parse(&format!("http://{host}:1984")).unwrap(),
            height,
            latency: Duration::from_millis(latency_ms),
        }
    }

    fn hosts(urls: &[Url]) -> Vec<&str> {
        urls.iter().map(|u| u.host_str().unwrap()).collect()
    }

    #[test]
    fn higher_height_first() {
        let ranked = rank_peers(vec![probe("a", 10, 5), probe("b", 12, 500)]);
        assert_eq!(hosts(&ranked), vec!["b", "a"]);
    }

    #[test]
    fn lower_latency_breaks_height_tie() {
        let ranked = rank_peers(vec![probe("a", 10, 300), probe("b", 10, 20), probe("c", 10, 100)]);
        assert_eq!(hosts(&ranked), vec!["b", "c", "a"]);
    }

    #[test]
    fn empty_input() {
        assert!(rank_peers(vec![]).is_empty());
        assert!(select_peers(vec![], 5, 10).is_empty());
    }

    #[test]
    fn select_drops_laggards_and_truncates() {
        let probes = vec![
            probe("a", 100, 10),
            probe("b", 94, 1),
            probe("c", 95, 1),
            probe("d", 100, 5),
            probe("e", 99, 50),
        ];
        let selected = select_peers(probes, 5, 3);
        assert_eq!(hosts(&selected), vec!["d", "a", "e"]);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn probes() -> impl Strategy<Value = Vec<PeerProbe>> {
            prop::collection::vec((0u64..50, 0u64..1_000), 0..30).prop_map(|v| {
                v.into_iter()
                    .enumerate()
                    .map(|(i, (h, l))| probe(&format!("p{i}"), h, l))
                    .collect()
            })
        }

        proptest! {
            #[test]
            fn ranking_is_idempotent(input in probes()) {
                let once = rank_peers(input.clone());
                let mut reversed = input.clone();
                reversed.reverse();
                prop_assert_eq!(&once, &rank_peers(reversed));
                prop_assert_eq!(once, rank_peers(input));
            }

            #[test]
            fn ranking_is_sorted(input in probes()) {
                let by_url: std::collections::HashMap<_, _> =
                    input.iter().map(|p| (p.url.clone(), (p.height, p.latency))).collect();
                let ranked = rank_peers(input);
                for pair in ranked.windows(2) {
                    let (h0, l0) = by_url[&pair[0]];
                    let (h1, l1) = by_url[&pair[1]];
                    prop_assert!(h0 > h1 || (h0 == h1 && l0 <= l1));
                }
            }
        }
    }
}
