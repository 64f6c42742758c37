//! Wire protocols. Only HTTP/1.1 (C3–C6) exists today; kept as its own
//! module so a future protocol could sit alongside it without disturbing
//! the gateway contract or server/worker/arbiter layers above it.

pub mod h1;
