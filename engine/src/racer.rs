//! First-success fan-out across the members of a client group.

use crate::client::{ClientGroup, NamedClient};
use crate::errors::{ClientError, EngineError, Result};
use crate::metrics_defs::{RACE_ATTEMPTS, RACE_DURATION};
use shared::histogram;
use std::future::Future;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RaceTimeouts {
    /// Upper bound for a single client's attempt.
    pub attempt: Duration,
    /// Upper bound for the whole race, across every wave.
    pub race: Duration,
}

#[derive(Debug)]
pub struct RaceOutcome<T> {
    pub value: T,
    pub winner: NamedClient,
    pub attempts: usize,
    pub elapsed: Duration,
}

/// Runs the same operation on several clients at once and keeps the first success.
///
/// The first `max_fanout` members of the group are raced together. Only if all of them
/// fail and the group has more members is a second wave started with the rest, inside
/// whatever is left of the race budget. Once a result is decided the shared
/// cancellation token is triggered and outstanding attempts are detached: they finish on
/// their own (bounded by the attempt timeout) and their results are dropped.
#[derive(Clone, Debug)]
pub struct Racer {
    timeouts: RaceTimeouts,
    max_fanout: usize,
}

impl Racer {
    pub fn new(timeouts: RaceTimeouts, max_fanout: usize) -> Self {
        Self {
            timeouts,
            max_fanout: max_fanout.max(1),
        }
    }

    pub fn timeouts(&self) -> RaceTimeouts {
        self.timeouts
    }

    pub async fn race<T, F, Fut>(
        &self,
        group: &ClientGroup,
        operation: &'static str,
        op: F,
    ) -> Result<RaceOutcome<T>>
    where
        T: Send + 'static,
        F: Fn(NamedClient, CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, ClientError>> + Send + 'static,
    {
        let members = group.members();
        if members.is_empty() {
            return Err(EngineError::NoClientsAvailable {
                scope: group.scope().to_string(),
            });
        }

        let start = Instant::now();
        let deadline = sleep_until(start + self.timeouts.race);
        tokio::pin!(deadline);

        let token = CancellationToken::new();
        let mut join_set = JoinSet::new();
        let mut attempts = 0;
        let mut last_failure: Option<(String, ClientError)> = None;

        let first_wave = self.max_fanout.min(members.len());
        let waves = [&members[..first_wave], &members[first_wave..]];

        for wave in waves.into_iter().filter(|wave| !wave.is_empty()) {
            if attempts > 0 {
                tracing::debug!(
                    scope = group.scope(),
                    operation,
                    remaining = wave.len(),
                    "First wave exhausted, racing remaining clients"
                );
            }

            for client in wave {
                attempts += 1;
                let attempt_timeout = self.timeouts.attempt;
                let fut = op(client.clone(), token.child_token());
                let client = client.clone();
                join_set.spawn(async move {
                    let result = match timeout(attempt_timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(ClientError::Timeout(attempt_timeout)),
                    };
                    (client, result)
                });
            }

            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        let pending = join_set.len();
                        token.cancel();
                        join_set.detach_all();

                        let elapsed = start.elapsed();
                        histogram!(RACE_DURATION, "operation" => operation, "outcome" => "timeout")
                            .record(elapsed.as_secs_f64());
                        tracing::warn!(scope = group.scope(), operation, ?elapsed, pending, "Race timed out");
                        return Err(EngineError::RaceTimeout { operation, elapsed, pending });
                    }
                    joined = join_set.join_next() => {
                        match joined {
                            Some(Ok((client, Ok(value)))) => {
                                token.cancel();
                                join_set.detach_all();

                                let elapsed = start.elapsed();
                                histogram!(RACE_DURATION, "operation" => operation, "outcome" => "won")
                                    .record(elapsed.as_secs_f64());
                                histogram!(RACE_ATTEMPTS, "operation" => operation).record(attempts as f64);
                                tracing::debug!(
                                    scope = group.scope(),
                                    operation,
                                    winner = client.name(),
                                    attempts,
                                    ?elapsed,
                                    "Race won"
                                );
                                return Ok(RaceOutcome { value, winner: client, attempts, elapsed });
                            }
                            Some(Ok((client, Err(error)))) => {
                                tracing::debug!(
                                    scope = group.scope(),
                                    operation,
                                    client = client.name(),
                                    %error,
                                    "Race attempt failed"
                                );
                                last_failure = Some((client.name().to_string(), error));
                            }
                            Some(Err(e)) => {
                                tracing::error!("Race attempt panicked: {}", e);
                                last_failure = Some(("unknown".to_string(), ClientError::Request(e.to_string())));
                            }
                            None => break,
                        }
                    }
                }
            }
        }

        token.cancel();
        let elapsed = start.elapsed();
        histogram!(RACE_DURATION, "operation" => operation, "outcome" => "exhausted")
            .record(elapsed.as_secs_f64());
        histogram!(RACE_ATTEMPTS, "operation" => operation).record(attempts as f64);

        let (client, sample) = last_failure.unwrap_or_else(|| {
            (
                "unknown".to_string(),
                ClientError::Request("no attempt completed".to_string()),
            )
        });
        tracing::warn!(scope = group.scope(), operation, attempts, "All clients failed");
        Err(EngineError::ExhaustedAllClients {
            operation,
            attempts,
            client,
            sample,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ResourceLocator;
    use crate::testutils::FakeClient;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn racer(attempt_ms: u64, race_ms: u64, max_fanout: usize) -> Racer {
        Racer::new(
            RaceTimeouts {
                attempt: Duration::from_millis(attempt_ms),
                race: Duration::from_millis(race_ms),
            },
            max_fanout,
        )
    }

    async fn resolve_and_fetch(
        racer: &Racer,
        group: &ClientGroup,
        id: &'static str,
    ) -> Result<RaceOutcome<bytes::Bytes>> {
        racer
            .race(group, "fetch", move |client, _token| async move {
                let locator = client.capability().resolve(id).await?;
                let content = client.capability().fetch(&locator).await?;
                Ok(content.bytes)
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_fastest_success_wins() {
        let group = ClientGroup::new(
            "telegram",
            vec![
                FakeClient::failing("a").named(),
                FakeClient::succeeding("b", b"from-b")
                    .with_delay(Duration::from_millis(50))
                    .named(),
                FakeClient::succeeding("c", b"from-c")
                    .with_delay(Duration::from_millis(500))
                    .named(),
            ],
            None,
        );
        let racer = racer(800, 1000, 3);

        let start = Instant::now();
        let outcome = resolve_and_fetch(&racer, &group, "file-1").await.unwrap();

        assert_eq!(outcome.value.as_ref(), b"from-b");
        assert_eq!(outcome.winner.name(), "b");
        assert_eq!(outcome.attempts, 3);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_not_blocked_by_hanging_losers() {
        let group = ClientGroup::new(
            "telegram",
            vec![
                FakeClient::hanging("slow-1").named(),
                FakeClient::hanging("slow-2").named(),
                FakeClient::succeeding("fast", b"ok")
                    .with_delay(Duration::from_millis(30))
                    .named(),
            ],
            None,
        );
        let racer = racer(5_000, 10_000, 3);

        let start = Instant::now();
        let outcome = resolve_and_fetch(&racer, &group, "file-1").await.unwrap();
        assert_eq!(outcome.winner.name(), "fast");
        assert!(start.elapsed() < Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failing_exhausts() {
        let group = ClientGroup::new(
            "telegram",
            vec![
                FakeClient::failing("a").named(),
                FakeClient::failing("b")
                    .with_delay(Duration::from_millis(100))
                    .named(),
            ],
            None,
        );
        let racer = racer(500, 1000, 3);

        let start = Instant::now();
        let err = resolve_and_fetch(&racer, &group, "file-1").await.unwrap_err();
        match err {
            EngineError::ExhaustedAllClients {
                attempts, client, ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(client, "b");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(start.elapsed() <= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeouts_count_as_failures() {
        let group = ClientGroup::new(
            "telegram",
            vec![FakeClient::hanging("a").named(), FakeClient::hanging("b").named()],
            None,
        );
        let racer = racer(100, 1000, 3);

        let start = Instant::now();
        let err = resolve_and_fetch(&racer, &group, "file-1").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ExhaustedAllClients {
                sample: ClientError::Timeout(_),
                ..
            }
        ));
        assert!(start.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_deadline() {
        let group = ClientGroup::new(
            "telegram",
            vec![
                FakeClient::succeeding("a", b"late")
                    .with_delay(Duration::from_millis(900))
                    .named(),
            ],
            None,
        );
        let racer = racer(1000, 300, 3);

        let start = Instant::now();
        let err = resolve_and_fetch(&racer, &group, "file-1").await.unwrap_err();
        assert!(matches!(err, EngineError::RaceTimeout { pending: 1, .. }));
        assert!(start.elapsed() <= Duration::from_millis(301));
    }

    #[tokio::test]
    async fn test_empty_group() {
        let group = ClientGroup::new("telegram", vec![], None);
        let err = resolve_and_fetch(&racer(100, 200, 3), &group, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoClientsAvailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_wave_after_capped_wave_fails() {
        let group = ClientGroup::new(
            "telegram",
            vec![
                FakeClient::failing("a").named(),
                FakeClient::failing("b").named(),
                FakeClient::succeeding("c", b"third").named(),
            ],
            None,
        );
        let launched = Arc::new(AtomicUsize::new(0));
        let racer = racer(500, 1000, 2);

        let counter = launched.clone();
        let outcome = racer
            .race(&group, "fetch", move |client, _token| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let locator = client.capability().resolve("file-1").await?;
                    Ok(client.capability().fetch(&locator).await?.bytes)
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.winner.name(), "c");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(launched.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_wave_not_started_on_first_wave_success() {
        let late = FakeClient::succeeding("c", b"third");
        let late_calls = late.calls();
        let group = ClientGroup::new(
            "telegram",
            vec![
                FakeClient::succeeding("a", b"first").named(),
                FakeClient::failing("b").named(),
                late.named(),
            ],
            None,
        );

        let outcome = resolve_and_fetch(&racer(500, 1000, 2), &group, "file-1")
            .await
            .unwrap();
        assert_eq!(outcome.winner.name(), "a");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_losers_observe_cancellation() {
        let group = ClientGroup::new(
            "telegram",
            vec![
                FakeClient::succeeding("fast", b"ok").named(),
                FakeClient::hanging("slow").named(),
            ],
            None,
        );
        let cancelled = Arc::new(AtomicUsize::new(0));

        let observed = cancelled.clone();
        let outcome = racer(5_000, 10_000, 3)
            .race(&group, "resolve", move |client, token| {
                let observed = observed.clone();
                async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            observed.fetch_add(1, Ordering::SeqCst);
                            Err(ClientError::Cancelled)
                        }
                        result = client.capability().resolve("file-1") => result,
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, ResourceLocator::new("fast/file-1"));
        // Let the detached loser run to its cancellation branch
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locators_stay_with_their_client() {
        let clients: Vec<_> = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                FakeClient::succeeding(name, name.as_bytes())
                    .with_delay(Duration::from_millis(10 * (3 - i as u64)))
            })
            .collect();
        let violations: Vec<_> = clients.iter().map(|c| c.foreign_locators()).collect();
        let group = ClientGroup::new(
            "telegram",
            clients.into_iter().map(FakeClient::named).collect(),
            None,
        );

        let outcome = resolve_and_fetch(&racer(500, 1000, 3), &group, "file-1")
            .await
            .unwrap();
        assert_eq!(outcome.value.as_ref(), outcome.winner.name().as_bytes());
        for counter in violations {
            assert_eq!(counter.load(Ordering::SeqCst), 0);
        }
    }
}
