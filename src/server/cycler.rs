use crate::{
    limits::WaitStrategy,
    server::{
        connection::{Connection, Readiness, Socket},
        dispatch::Dispatcher,
    },
    ws::session::WebSocketHandler,
};
use crossbeam::queue::SegQueue;
use std::{future::poll_fn, sync::Arc, task::Poll};
use tokio::{
    sync::{Notify, Semaphore},
    task::{yield_now, JoinSet},
    time::sleep as tokio_sleep,
};
use tracing::{trace, warn};

/// Drives every open, non-upgraded connection of a server.
///
/// Each pass snapshots the set, submits the connections with pending bytes
/// to the worker pool, waits for that batch, and puts the survivors back.
/// The gate holds one permit per connection in the set, so an empty cycler
/// sleeps on it instead of spinning. A pass with nothing ready parks until
/// one of the polled sockets turns readable or a connection is added.
pub(crate) struct Cycler<S, D, W> {
    queue: SegQueue<Connection<S, D, W>>,
    gate: Semaphore,
    added: Notify,
    workers: Arc<Semaphore>,
    wait_strategy: WaitStrategy,
}

impl<S, D, W> Cycler<S, D, W>
where
    S: Socket,
    D: Dispatcher<W>,
    W: WebSocketHandler,
{
    pub(crate) fn new(workers: usize, wait_strategy: WaitStrategy) -> Self {
        Self {
            queue: SegQueue::new(),
            gate: Semaphore::new(0),
            added: Notify::new(),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            wait_strategy,
        }
    }

    /// Adds a new connection and wakes a parked cycler.
    #[inline]
    pub(crate) fn add(&self, connection: Connection<S, D, W>) {
        self.put_back(connection);
        self.added.notify_one();
    }

    #[inline]
    fn put_back(&self, connection: Connection<S, D, W>) {
        self.queue.push(connection);
        self.gate.add_permits(1);
    }

    #[inline]
    fn remove(&self) {
        if let Ok(permit) = self.gate.try_acquire() {
            permit.forget();
        }
    }

    /// Connections currently parked in the set.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) async fn run(self: Arc<Self>) {
        loop {
            match self.gate.acquire().await {
                Ok(permit) => drop(permit),
                Err(_) => return,
            }

            if self.pass().await == 0 {
                self.park().await;
            }
        }
    }

    /// Waits for a socket polled by the last pass to wake this task, for a
    /// new connection, or for the idle sweep interval.
    async fn park(&self) {
        match self.wait_strategy {
            WaitStrategy::Yield => yield_now().await,
            WaitStrategy::Sleep(sweep) => {
                tokio::select! {
                    _ = next_wake() => {}
                    _ = self.added.notified() => {}
                    _ = tokio_sleep(sweep) => {}
                }
            }
        }
    }

    /// One scheduling round. Returns how many connections were served.
    pub(crate) async fn pass(&self) -> usize {
        let mut batch = JoinSet::new();

        for _ in 0..self.queue.len() {
            let Some(mut connection) = self.queue.pop() else {
                break;
            };

            match connection.poll_ready().await {
                Readiness::Ready => {
                    self.remove();
                    let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                        return 0;
                    };

                    batch.spawn(async move {
                        let _permit = permit;
                        connection.serve().await
                    });
                }
                Readiness::Idle if connection.is_idle_expired() => {
                    trace!("dropping idle connection");
                    self.remove();
                }
                Readiness::Idle => self.queue.push(connection),
                Readiness::Gone => self.remove(),
            }
        }

        let served = batch.len();
        while let Some(joined) = batch.join_next().await {
            match joined {
                Ok(Some(connection)) => self.put_back(connection),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "connection task failed"),
            }
        }

        served
    }
}

/// Completes on the next wake of the current task.
///
/// Sockets that answered `Pending` during a pass hold this task's waker, so
/// the wake arrives as soon as any of them turns readable.
async fn next_wake() {
    let mut parked = false;
    poll_fn(|_| match parked {
        true => Poll::Ready(()),
        false => {
            parked = true;
            Poll::Pending
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        limits::ConnLimits,
        server::{
            connection::test_app::{connection, Echo, TestApp},
            server::AllLimits,
        },
        tools::str_op,
    };
    use std::time::{Duration, Instant};
    use tokio::{
        io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
        time::timeout,
    };

    fn cycler<S: Socket>() -> Cycler<S, TestApp, Echo> {
        Cycler::new(2, WaitStrategy::Sleep(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn serves_ready_and_parks_idle() {
        let cycler = cycler();
        let (mut busy, server) = duplex(4096);
        let (_quiet, quiet_server) = duplex(4096);

        busy.write_all(b"GET /hello HTTP/1.1\r\n\r\n").await.unwrap();
        cycler.add(connection(server, AllLimits::default()));
        cycler.add(connection(quiet_server, AllLimits::default()));
        assert_eq!(cycler.len(), 2);

        assert_eq!(cycler.pass().await, 1);
        // Keep-alive survivor is back in the set with the idle one
        assert_eq!(cycler.len(), 2);
        assert_eq!(cycler.gate.available_permits(), 2);

        let mut head = [0u8; 17];
        busy.read_exact(&mut head).await.unwrap();
        assert_eq!(str_op(&head), "HTTP/1.1 200 OK\r\n");

        assert_eq!(cycler.pass().await, 0);
        assert_eq!(cycler.len(), 2);
    }

    #[tokio::test]
    async fn drops_closed_and_expired() {
        let cycler = cycler();
        let limits = AllLimits {
            conn: ConnLimits {
                idle_timeout: Duration::from_millis(10),
                ..ConnLimits::default()
            },
            ..AllLimits::default()
        };

        let (gone, server) = duplex(1024);
        let (mut idle, idle_server) = duplex(1024);
        cycler.add(connection(server, limits.clone()));
        cycler.add(connection(idle_server, limits));
        drop(gone);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cycler.pass().await, 0);
        assert_eq!(cycler.len(), 0);
        assert_eq!(cycler.gate.available_permits(), 0);

        // Server side was dropped
        let mut rest = Vec::new();
        idle.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn run_loop_answers_requests() {
        let cycler = Arc::new(cycler());
        tokio::spawn(Arc::clone(&cycler).run());

        let (mut client, server) = duplex(4096);
        cycler.add(connection(server, AllLimits::default()));

        client
            .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = str_op(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hello"));
    }

    async fn read_response(client: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        str_op(&out).to_owned()
    }

    #[tokio::test]
    async fn trickling_client_does_not_starve_others() {
        let cycler = Arc::new(cycler());
        tokio::spawn(Arc::clone(&cycler).run());

        let limits = AllLimits {
            conn: ConnLimits {
                signature_timeout: Duration::from_millis(100),
                ..ConnLimits::default()
            },
            ..AllLimits::default()
        };

        let (mut slow, slow_server) = duplex(1024);
        cycler.add(connection(slow_server, limits.clone()));
        tokio::spawn(async move {
            while slow.write_all(b"\r\n").await.is_ok() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let started = Instant::now();
        let (mut client, server) = duplex(4096);
        client
            .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        cycler.add(connection(server, limits));

        let text = timeout(Duration::from_secs(1), read_response(&mut client))
            .await
            .unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn parked_cycler_wakes_on_readable_socket() {
        // The sweep interval alone would leave the request unanswered
        let cycler = Arc::new(Cycler::new(2, WaitStrategy::Sleep(Duration::from_secs(30))));
        tokio::spawn(Arc::clone(&cycler).run());

        let (mut client, server) = duplex(4096);
        cycler.add(connection(server, AllLimits::default()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        client
            .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let text = timeout(Duration::from_secs(2), read_response(&mut client))
            .await
            .unwrap();
        assert!(text.ends_with("hello"));
    }
}
