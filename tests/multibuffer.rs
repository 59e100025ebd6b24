//! Multi-buffer aggregation: writes sharing a decomposition ride one
//! rearrangement, and the buffer drains on decomposition switch, budget
//! overflow, and sync.

mod util;

use pario::prelude::*;
use util::{le_i32s, raw_data_section, run_ranks};

/// Three variables, three writes, one rearrangement.
#[test]
fn three_writes_one_rearrangement() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agg.par").to_string_lossy().into_owned();
    let path_in = path.clone();
    run_ranks(1, move |comm| {
        let ctx = PioContext::new();
        let iosysid = ctx.init_intracomm(comm, 1, 1, 0, Rearranger::Box).unwrap();
        let ioid = ctx
            .init_decomp(iosysid, PioType::Int, &[4], &[1, 2, 3, 4], None, None, None)
            .unwrap();
        let ncid = ctx
            .create_file(iosysid, &path_in, CreateMode::Clobber, IoType::Classic)
            .unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(4)).unwrap();
        let a = ctx.def_var(ncid, "a", PioType::Int, &[x]).unwrap();
        let b = ctx.def_var(ncid, "b", PioType::Int, &[x]).unwrap();
        let c = ctx.def_var(ncid, "c", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();

        ctx.write_darray(ncid, a, ioid, &[1i32, 2, 3, 4], None).unwrap();
        ctx.write_darray(ncid, b, ioid, &[5i32, 6, 7, 8], None).unwrap();
        ctx.write_darray(ncid, c, ioid, &[9i32, 10, 11, 12], None).unwrap();
        assert_eq!(ctx.file_rearranges(ncid).unwrap(), 0, "writes are queued, not flushed");

        ctx.sync(ncid).unwrap();
        assert_eq!(ctx.file_rearranges(ncid).unwrap(), 1, "one flush, one rearrangement");

        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, ioid).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
    });
    // Var data blocks land in definition order.
    assert_eq!(raw_data_section(&path), le_i32s(1..13));
}

/// Targeting another decomposition drains the queue first.
#[test]
fn decomposition_switch_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("switch.par").to_string_lossy().into_owned();
    run_ranks(1, move |comm| {
        let ctx = PioContext::new();
        let iosysid = ctx.init_intracomm(comm, 1, 1, 0, Rearranger::Box).unwrap();
        let d1 = ctx
            .init_decomp(iosysid, PioType::Int, &[4], &[1, 2, 3, 4], None, None, None)
            .unwrap();
        let d2 = ctx
            .init_decomp(iosysid, PioType::Int, &[4], &[4, 3, 2, 1], None, None, None)
            .unwrap();
        let ncid = ctx
            .create_file(iosysid, &path, CreateMode::Clobber, IoType::Classic)
            .unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(4)).unwrap();
        let a = ctx.def_var(ncid, "a", PioType::Int, &[x]).unwrap();
        let b = ctx.def_var(ncid, "b", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();

        ctx.write_darray(ncid, a, d1, &[1i32, 2, 3, 4], None).unwrap();
        assert_eq!(ctx.file_rearranges(ncid).unwrap(), 0);
        // Different decomposition: the queued write must land first.
        ctx.write_darray(ncid, b, d2, &[40i32, 30, 20, 10], None).unwrap();
        assert_eq!(ctx.file_rearranges(ncid).unwrap(), 1);

        ctx.sync(ncid).unwrap();
        assert_eq!(ctx.file_rearranges(ncid).unwrap(), 2);

        let mut back = vec![0i32; 4];
        ctx.read_darray(ncid, b, d2, &mut back).unwrap();
        assert_eq!(back, vec![40, 30, 20, 10]);

        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, d1).unwrap();
        ctx.free_decomp(iosysid, d2).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
    });
}

/// Exceeding the byte budget forces a flush mid-stream.
#[test]
fn buffer_budget_forces_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("budget.par").to_string_lossy().into_owned();
    run_ranks(1, move |comm| {
        let ctx = PioContext::new();
        // Two queued 4-element int arrays cross a 20-byte budget.
        ctx.set_buffer_size_limit(20);
        let iosysid = ctx.init_intracomm(comm, 1, 1, 0, Rearranger::Box).unwrap();
        let ioid = ctx
            .init_decomp(iosysid, PioType::Int, &[4], &[1, 2, 3, 4], None, None, None)
            .unwrap();
        let ncid = ctx
            .create_file(iosysid, &path, CreateMode::Clobber, IoType::Classic)
            .unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(4)).unwrap();
        let a = ctx.def_var(ncid, "a", PioType::Int, &[x]).unwrap();
        let b = ctx.def_var(ncid, "b", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();

        ctx.write_darray(ncid, a, ioid, &[1i32, 2, 3, 4], None).unwrap();
        assert_eq!(ctx.file_rearranges(ncid).unwrap(), 0);
        ctx.write_darray(ncid, b, ioid, &[5i32, 6, 7, 8], None).unwrap();
        assert_eq!(ctx.file_rearranges(ncid).unwrap(), 1, "budget overflow flushed the pair");

        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, ioid).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
    });
}

/// `write_darray_multi` bypasses the queue entirely.
#[test]
fn explicit_multi_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("multi.par").to_string_lossy().into_owned();
    let path_in = path.clone();
    run_ranks(2, move |comm| {
        let r = comm.rank();
        let ctx = PioContext::new();
        ctx.set_blocksize(4).unwrap();
        let iosysid = ctx.init_intracomm(comm, 2, 1, 0, Rearranger::Box).unwrap();
        let map: Vec<u64> = if r == 0 { vec![1, 2, 3, 4] } else { vec![5, 6, 7, 8] };
        let ioid = ctx
            .init_decomp(iosysid, PioType::Int, &[8], &map, None, None, None)
            .unwrap();
        let ncid = ctx
            .create_file(iosysid, &path_in, CreateMode::Clobber, IoType::ClassicParallel)
            .unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(8)).unwrap();
        let a = ctx.def_var(ncid, "a", PioType::Int, &[x]).unwrap();
        let b = ctx.def_var(ncid, "b", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();

        let av: Vec<i32> = map.iter().map(|&m| m as i32).collect();
        let bv: Vec<i32> = map.iter().map(|&m| m as i32 + 100).collect();
        ctx.write_darray_multi(ncid, &[a, b], ioid, &[&av, &bv], &[0, 0], &[None, None], true)
            .unwrap();
        assert_eq!(ctx.file_rearranges(ncid).unwrap(), 1);

        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, ioid).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
    });
    let mut want = le_i32s(1..9);
    want.extend(le_i32s(101..109));
    assert_eq!(raw_data_section(&path), want);
}
