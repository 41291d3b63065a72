/// Shared constants and default protocol knobs

/// Default bit width of the prime modulus backing the OT group.
///
/// 64 bits keeps sessions fast for demonstration purposes; production use
/// demands 2048 bits or more.
pub const DEFAULT_PRIME_BITS: u64 = 64;

/// Default wire-label width in bytes (128-bit labels).
pub const DEFAULT_LABEL_BYTES: usize = 16;

/// Default TCP port for two-party sessions.
pub const DEFAULT_PORT: u16 = 4080;

/// Candidates drawn before prime generation gives up.
pub const PRIME_CANDIDATE_BUDGET: usize = 100_000;

/// Candidates drawn before generator search gives up.
pub const GENERATOR_CANDIDATE_BUDGET: usize = 10_000;

/// Miller-Rabin rounds for probable-prime testing.
pub const MILLER_RABIN_ROUNDS: usize = 32;

/// Connection attempts the initiating party makes before aborting.
pub const CONNECT_RETRIES: u32 = 50;

/// Delay between connection attempts in milliseconds.
pub const CONNECT_RETRY_DELAY_MS: u64 = 100;

/// Upper bound on an incoming frame, protecting against garbage length prefixes.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
