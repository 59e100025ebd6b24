//! Async mode: dedicated IO processes driven by the message-dispatch
//! loop, with the observed message sequence and file contents checked
//! against a synchronous reference.

mod util;

use pario::prelude::*;
use pario::MsgCode;
use util::{le_i32s, raw_data_section, run_ranks};

/// One IO process, two compute processes: create, define, write, close.
/// The IO process returns from init only after Exit and must have seen
/// the calls in the order the compute master issued them.
#[test]
fn async_roundtrip_message_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("async.par").to_string_lossy().into_owned();
    let path_in = path.clone();
    let logs = run_ranks(3, move |comm| {
        let r = comm.rank();
        let ctx = PioContext::new();
        let ids = ctx
            .init_async(comm, &[0], &[vec![1, 2]], Rearranger::Box)
            .unwrap();
        let iosysid = ids[0];
        if r == 0 {
            // IO process: the loop already ran to Exit.
            return ctx.dispatch_log();
        }

        let comp_rank = r - 1;
        let map: Vec<u64> = (1..=4).map(|i| (comp_rank * 4 + i) as u64).collect();
        let ioid = ctx
            .init_decomp(iosysid, PioType::Int, &[8], &map, None, None, None)
            .unwrap();
        let ncid = ctx
            .create_file(iosysid, &path_in, CreateMode::Clobber, IoType::ClassicParallel)
            .unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(8)).unwrap();
        let v = ctx.def_var(ncid, "data", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();
        let vals: Vec<i32> = (0..4).map(|i| (comp_rank * 4 + i) as i32).collect();
        ctx.write_darray(ncid, v, ioid, &vals, None).unwrap();
        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, ioid).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
        Vec::new()
    });

    assert_eq!(
        logs[0],
        vec![
            MsgCode::InitDecomp,
            MsgCode::CreateFile,
            MsgCode::DefDim,
            MsgCode::DefVar,
            MsgCode::Enddef,
            MsgCode::WriteDarrayMulti,
            MsgCode::CloseFile,
            MsgCode::FreeDecomp,
            MsgCode::Exit,
        ],
        "IO root sees the public-API call sequence"
    );

    assert_eq!(raw_data_section(&path), le_i32s(0..8));
}

/// The async file is byte-identical to one produced synchronously.
#[test]
fn async_matches_synchronous_reference() {
    let dir = tempfile::tempdir().unwrap();
    let async_path = dir.path().join("a.par").to_string_lossy().into_owned();
    let sync_path = dir.path().join("s.par").to_string_lossy().into_owned();

    let a = async_path.clone();
    run_ranks(3, move |comm| {
        let r = comm.rank();
        let ctx = PioContext::new();
        let ids = ctx.init_async(comm, &[0], &[vec![1, 2]], Rearranger::Box).unwrap();
        if r == 0 {
            return;
        }
        let comp_rank = r - 1;
        let map: Vec<u64> = (1..=4).map(|i| (comp_rank * 4 + i) as u64).collect();
        let ioid = ctx
            .init_decomp(ids[0], PioType::Int, &[8], &map, None, None, None)
            .unwrap();
        let ncid = ctx
            .create_file(ids[0], &a, CreateMode::Clobber, IoType::ClassicParallel)
            .unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(8)).unwrap();
        let v = ctx.def_var(ncid, "data", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();
        let vals: Vec<i32> = (0..4).map(|i| (comp_rank * 4 + i) as i32).collect();
        ctx.write_darray(ncid, v, ioid, &vals, None).unwrap();
        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(ids[0], ioid).unwrap();
        ctx.free_iosystem(ids[0]).unwrap();
    });

    let s = sync_path.clone();
    run_ranks(2, move |comm| {
        let r = comm.rank();
        let ctx = PioContext::new();
        let iosysid = ctx.init_intracomm(comm, 1, 1, 0, Rearranger::Box).unwrap();
        let map: Vec<u64> = (1..=4).map(|i| (r * 4 + i) as u64).collect();
        let ioid = ctx
            .init_decomp(iosysid, PioType::Int, &[8], &map, None, None, None)
            .unwrap();
        let ncid = ctx
            .create_file(iosysid, &s, CreateMode::Clobber, IoType::ClassicParallel)
            .unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(8)).unwrap();
        let v = ctx.def_var(ncid, "data", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();
        let vals: Vec<i32> = (0..4).map(|i| (r * 4 + i) as i32).collect();
        ctx.write_darray(ncid, v, ioid, &vals, None).unwrap();
        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, ioid).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
    });

    assert_eq!(
        std::fs::read(&async_path).unwrap(),
        std::fs::read(&sync_path).unwrap()
    );
}

/// Async reads flow back through the reverse exchange.
#[test]
fn async_read_darray() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aread.par").to_string_lossy().into_owned();
    let got = run_ranks(3, move |comm| {
        let r = comm.rank();
        let ctx = PioContext::new();
        let ids = ctx.init_async(comm, &[0], &[vec![1, 2]], Rearranger::Box).unwrap();
        if r == 0 {
            return Vec::new();
        }
        let comp_rank = r - 1;
        let map: Vec<u64> = (1..=3).map(|i| (comp_rank * 3 + i) as u64).collect();
        let ioid = ctx
            .init_decomp(ids[0], PioType::Double, &[6], &map, None, None, None)
            .unwrap();
        let ncid = ctx
            .create_file(ids[0], &path, CreateMode::Clobber, IoType::ClassicParallel)
            .unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(6)).unwrap();
        let v = ctx.def_var(ncid, "data", PioType::Double, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();
        let vals: Vec<f64> = map.iter().map(|&m| m as f64 * 1.5).collect();
        ctx.write_darray(ncid, v, ioid, &vals, None).unwrap();
        ctx.sync(ncid).unwrap();
        let mut back = vec![0f64; 3];
        ctx.read_darray(ncid, v, ioid, &mut back).unwrap();
        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(ids[0], ioid).unwrap();
        ctx.free_iosystem(ids[0]).unwrap();
        back
    });
    assert_eq!(got[1], vec![1.5, 3.0, 4.5]);
    assert_eq!(got[2], vec![6.0, 7.5, 9.0]);
}

/// Deriving the process lists from existing communicators.
#[test]
fn async_from_comms() {
    run_ranks(3, |comm| {
        let in_io = comm.rank() == 0;
        let io_comm = comm.split(if in_io { Some(0) } else { None }, &[0]).unwrap();
        let comp_comm = comm
            .split(if in_io { None } else { Some(0) }, &[1, 2])
            .unwrap();
        let ctx = PioContext::new();
        let ids = ctx
            .init_async_from_comms(comm, &[comp_comm], io_comm, Rearranger::Subset)
            .unwrap();
        assert_eq!(ids.len(), 1);
        if !in_io {
            assert!(ctx.iosystem_is_active(ids[0]));
            assert_eq!(ctx.get_numiotasks(ids[0]).unwrap(), 1);
            ctx.free_iosystem(ids[0]).unwrap();
        }
    });
}
