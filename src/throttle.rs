//! Token-bucket rate limiting for inbound flow streams.
//!
//! [`ThrottledReader`] wraps any [`AsyncRead`] and enforces an average rate
//! in bits per second. The bucket starts empty so a fresh reader pays for
//! every byte from the first one. A [`RateHandle`] can retune the rate from
//! another task while a read is in flight; the new rate takes effect within
//! one refill interval.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Duration, Instant, Sleep};

/// Refill granularity; also the upper bound on one deficit sleep, so rate
/// changes are observed promptly even during long waits.
pub const REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// 1 KiB floor on bucket capacity, in token bits. Keeps throughput sane at
/// rates where `rate * REFILL_INTERVAL` would round toward nothing.
const MIN_BUCKET_BITS: f64 = 8.0 * 1024.0;

/// Largest slice handed to the inner reader per poll.
const MAX_CHUNK_BYTES: usize = 64 * 1024;

fn sanitize(rate_bps: f64) -> f64 {
    if rate_bps.is_finite() && rate_bps > 0.0 { rate_bps } else { 0.0 }
}

fn capacity_for(rate_bps: f64) -> f64 {
    (rate_bps * REFILL_INTERVAL.as_secs_f64()).max(MIN_BUCKET_BITS)
}

#[derive(Debug)]
struct Bucket {
    /// Bits per second; 0 disables accounting entirely.
    rate_bps: f64,
    capacity_bits: f64,
    tokens_bits: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_bps: f64) -> Self {
        let rate = sanitize(rate_bps);
        Self {
            rate_bps: rate,
            capacity_bits: capacity_for(rate),
            tokens_bits: 0.0,
            last_refill: Instant::now(),
        }
    }

    fn limited(&self) -> bool {
        self.rate_bps > 0.0
    }

    fn refill(&mut self, now: Instant) {
        if self.limited() {
            let dt = now.saturating_duration_since(self.last_refill).as_secs_f64();
            self.tokens_bits = (self.tokens_bits + self.rate_bps * dt).min(self.capacity_bits);
        }
        self.last_refill = now;
    }

    fn set_rate(&mut self, rate_bps: f64) {
        // Settle accrual under the old rate first; in-flight tokens survive.
        self.refill(Instant::now());
        self.rate_bps = sanitize(rate_bps);
        self.capacity_bits = capacity_for(self.rate_bps);
        self.tokens_bits = self.tokens_bits.min(self.capacity_bits);
    }
}

/// Cloneable handle for retuning a throttled stream's rate.
#[derive(Debug, Clone)]
pub struct RateHandle {
    bucket: Arc<Mutex<Bucket>>,
}

impl RateHandle {
    /// `rate_bps` in bits per second; 0 (or any non-finite / non-positive
    /// value) means unlimited.
    pub fn new(rate_bps: f64) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(Bucket::new(rate_bps))),
        }
    }

    pub fn set_new_rate(&self, rate_bps: f64) {
        self.bucket.lock().expect("throttle bucket lock").set_rate(rate_bps);
    }

    /// Current rate in bits per second; 0 when unlimited.
    pub fn rate(&self) -> f64 {
        self.bucket.lock().expect("throttle bucket lock").rate_bps
    }
}

/// An [`AsyncRead`] wrapper enforcing the token-bucket rate of its
/// [`RateHandle`].
#[derive(Debug)]
pub struct ThrottledReader<R> {
    inner: R,
    bucket: Arc<Mutex<Bucket>>,
    sleep: Option<Pin<Box<Sleep>>>,
    scratch: Vec<u8>,
}

impl<R> ThrottledReader<R> {
    pub fn new(inner: R, handle: &RateHandle) -> Self {
        Self {
            inner,
            bucket: Arc::clone(&handle.bucket),
            sleep: None,
            scratch: Vec::new(),
        }
    }

    /// Convenience constructor returning the reader and a fresh handle.
    pub fn with_rate(inner: R, rate_bps: f64) -> (Self, RateHandle) {
        let handle = RateHandle::new(rate_bps);
        let reader = Self::new(inner, &handle);
        (reader, handle)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

enum Gate {
    Unlimited,
    Allowed(usize),
    Wait(Duration),
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(sleep) = this.sleep.as_mut() {
                match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => this.sleep = None,
                    Poll::Pending => return Poll::Pending,
                }
            }

            let gate = {
                let mut bucket = this.bucket.lock().expect("throttle bucket lock");
                if !bucket.limited() {
                    Gate::Unlimited
                } else if buf.remaining() == 0 {
                    Gate::Allowed(0)
                } else {
                    bucket.refill(Instant::now());
                    let want_bytes = buf.remaining().min(MAX_CHUNK_BYTES);
                    if bucket.tokens_bits >= 8.0 {
                        Gate::Allowed(((bucket.tokens_bits / 8.0) as usize).min(want_bytes))
                    } else {
                        let target_bits = ((want_bytes * 8) as f64).min(bucket.capacity_bits);
                        let deficit_bits = target_bits - bucket.tokens_bits;
                        let wait = Duration::from_secs_f64(deficit_bits / bucket.rate_bps);
                        Gate::Wait(wait.clamp(Duration::from_millis(1), REFILL_INTERVAL))
                    }
                }
            };

            match gate {
                Gate::Unlimited => return Pin::new(&mut this.inner).poll_read(cx, buf),
                Gate::Allowed(0) => return Poll::Ready(Ok(())),
                Gate::Wait(duration) => {
                    this.sleep = Some(Box::pin(tokio::time::sleep(duration)));
                }
                Gate::Allowed(allowed) => {
                    if this.scratch.len() < allowed {
                        this.scratch.resize(allowed, 0);
                    }
                    let mut chunk = ReadBuf::new(&mut this.scratch[..allowed]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut chunk) {
                        Poll::Ready(Ok(())) => {
                            let n = chunk.filled().len();
                            if n > 0 {
                                buf.put_slice(chunk.filled());
                                let mut bucket = this.bucket.lock().expect("throttle bucket lock");
                                bucket.tokens_bits = (bucket.tokens_bits - (n * 8) as f64).max(0.0);
                            }
                            return Poll::Ready(Ok(()));
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}
