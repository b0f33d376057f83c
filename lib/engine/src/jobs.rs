//! Job identity and cooperative yielding for autolink passes.

use ahash::AHashSet;
use parking_lot::Mutex;
use tracing::warn;

const ALPHABET_LEN: u32 = 26;
const JOB_ID_LEN: u32 = 3;

/// Number of distinct ids before the generator wraps around.
pub const JOB_ID_SPACE: u32 = ALPHABET_LEN * ALPHABET_LEN * ALPHABET_LEN;

/// Hands out three-letter job ids `aaa`, `aab`, ... `zzz`.
///
/// After `zzz` the sequence restarts at `aaa`. Ids of long-finished passes
/// can therefore repeat; a stale yield request for a recycled id would hit
/// the newer pass.
#[derive(Debug, Default)]
pub struct JobIdGenerator {
    next: Mutex<u32>,
}

impl JobIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate_job_id(&self) -> String {
        let mut next = self.next.lock();
        let value = *next;
        *next += 1;
        if *next >= JOB_ID_SPACE {
            warn!("Job id space exhausted, wrapping around to 'aaa'");
            *next = 0;
        }
        encode(value)
    }
}

fn encode(mut value: u32) -> String {
    let mut letters = [b'a'; JOB_ID_LEN as usize];
    for slot in letters.iter_mut().rev() {
        *slot = b'a' + (value % ALPHABET_LEN) as u8;
        value /= ALPHABET_LEN;
    }
    letters.iter().map(|b| *b as char).collect()
}

/// Jobs that have been asked to stop at the next contact boundary.
#[derive(Debug, Default)]
pub struct YieldController {
    jobs: Mutex<AHashSet<String>>,
}

impl YieldController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job_to_yield(&self, job_id: &str) {
        self.jobs.lock().insert(job_id.to_string());
    }

    pub fn should_job_yield(&self, job_id: &str) -> bool {
        self.jobs.lock().contains(job_id)
    }

    pub fn remove_job(&self, job_id: &str) -> bool {
        self.jobs.lock().remove(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_cover_the_space() {
        let generator = JobIdGenerator::new();
        let mut seen = AHashSet::new();
        for _ in 0..JOB_ID_SPACE {
            let id = generator.generate_job_id();
            assert_eq!(id.len(), 3);
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 17_576);
        assert!(seen.contains("aaa"));
        assert!(seen.contains("zzz"));
        assert_eq!(generator.generate_job_id(), "aaa");
    }

    #[test]
    fn test_job_id_order() {
        let generator = JobIdGenerator::new();
        assert_eq!(generator.generate_job_id(), "aaa");
        assert_eq!(generator.generate_job_id(), "aab");
        assert_eq!(encode(26), "aba");
        assert_eq!(encode(JOB_ID_SPACE - 1), "zzz");
    }

    #[test]
    fn test_yield_controller() {
        let controller = YieldController::new();
        assert!(!controller.should_job_yield("abc"));
        controller.add_job_to_yield("abc");
        assert!(controller.should_job_yield("abc"));
        assert!(!controller.should_job_yield("abd"));
        assert!(controller.remove_job("abc"));
        assert!(!controller.should_job_yield("abc"));
        assert!(!controller.remove_job("abc"));
    }
}
