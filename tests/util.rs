#![allow(dead_code)]
//! Shared harness for multi-rank tests: each rank of a mailbox world
//! runs on its own thread with its own library context, exactly the way
//! one MPI process per rank would.

use std::sync::Arc;
use std::thread;

use pario::comm::local::LocalWorld;
use pario::comm::Comm;

/// Run `f` on `n` ranks of a fresh world; returns the per-rank results
/// in rank order.
pub fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
where
    F: Fn(Arc<dyn Comm>) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let world = LocalWorld::new(n);
    let f = Arc::new(f);
    let handles: Vec<_> = (0..n)
        .map(|r| {
            let comm = world.comm(r);
            let f = f.clone();
            thread::Builder::new()
                .name(format!("rank-{r}"))
                .spawn(move || f(comm))
                .expect("spawn rank thread")
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}

/// Raw bytes of a classic file's data section (everything past the
/// header), for checking exactly what landed on disk.
pub fn raw_data_section(path: &str) -> Vec<u8> {
    let bytes = std::fs::read(path).expect("read file");
    assert_eq!(&bytes[0..4], b"PAR1", "not a classic array file");
    let data_start = u64::from_le_bytes(bytes[16..24].try_into().unwrap()) as usize;
    bytes[data_start..].to_vec()
}

/// Little-endian bytes of an i32 sequence.
pub fn le_i32s(vals: impl IntoIterator<Item = i32>) -> Vec<u8> {
    vals.into_iter().flat_map(|v| v.to_le_bytes()).collect()
}
