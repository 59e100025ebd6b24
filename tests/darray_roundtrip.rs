//! Write/read round trips of a 1-D distributed array: box and subset
//! rearrangers, parallel and funneled (serial) backends, and the
//! flow-controlled exchange driven end to end.

mod util;

use pario::prelude::*;
use util::{le_i32s, raw_data_section, run_ranks};

/// 16 elements over 4 compute tasks (4 contiguous each), 2 IO tasks.
fn linear_write(
    path: String,
    rearranger: Rearranger,
    iotype: IoType,
    opts: Option<(CommType, FcDirection, FcOptions)>,
) -> Vec<Vec<i32>> {
    run_ranks(4, move |comm| {
        let r = comm.rank();
        let ctx = PioContext::new();
        ctx.set_blocksize(8).unwrap();
        let iosysid = ctx.init_intracomm(comm, 2, 2, 0, rearranger).unwrap();
        if let Some((ct, dir, fc)) = opts {
            ctx.set_rearr_opts(iosysid, ct, dir, fc, fc).unwrap();
        }
        let map: Vec<u64> = (1..=4).map(|i| (r * 4 + i) as u64).collect();
        let ioid = ctx
            .init_decomp(iosysid, PioType::Int, &[16], &map, None, None, None)
            .unwrap();

        let ncid = ctx.create_file(iosysid, &path, CreateMode::Clobber, iotype).unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(16)).unwrap();
        let v = ctx.def_var(ncid, "data", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();

        let vals: Vec<i32> = (0..4).map(|i| (r * 4 + i) as i32).collect();
        ctx.write_darray(ncid, v, ioid, &vals, None).unwrap();
        ctx.sync(ncid).unwrap();

        let mut back = vec![0i32; 4];
        ctx.read_darray(ncid, v, ioid, &mut back).unwrap();

        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, ioid).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
        back
    })
}

#[test]
fn box_linear_bytes_and_readback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("box.par").to_string_lossy().into_owned();
    let got = linear_write(path.clone(), Rearranger::Box, IoType::ClassicParallel, None);
    for (r, back) in got.iter().enumerate() {
        let want: Vec<i32> = (0..4).map(|i| (r * 4 + i) as i32).collect();
        assert_eq!(back, &want, "rank {r} read its own slice back");
    }
    // The on-disk data section is exactly 0..15, little-endian.
    assert_eq!(raw_data_section(&path), le_i32s(0..16));
}

#[test]
fn subset_produces_identical_file_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let box_path = dir.path().join("box.par").to_string_lossy().into_owned();
    let sub_path = dir.path().join("sub.par").to_string_lossy().into_owned();
    linear_write(box_path.clone(), Rearranger::Box, IoType::ClassicParallel, None);
    let got = linear_write(sub_path.clone(), Rearranger::Subset, IoType::ClassicParallel, None);
    for (r, back) in got.iter().enumerate() {
        let want: Vec<i32> = (0..4).map(|i| (r * 4 + i) as i32).collect();
        assert_eq!(back, &want);
    }
    assert_eq!(
        std::fs::read(&box_path).unwrap(),
        std::fs::read(&sub_path).unwrap(),
        "box and subset write byte-identical files"
    );
}

#[test]
fn serial_backend_funnels_through_io_root() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("serial.par").to_string_lossy().into_owned();
    let got = linear_write(path.clone(), Rearranger::Box, IoType::Classic, None);
    for (r, back) in got.iter().enumerate() {
        let want: Vec<i32> = (0..4).map(|i| (r * 4 + i) as i32).collect();
        assert_eq!(back, &want);
    }
    assert_eq!(raw_data_section(&path), le_i32s(0..16));
}

#[test]
fn flow_controlled_exchange_matches_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fc.par").to_string_lossy().into_owned();
    let fc = FcOptions { handshake: true, isend: true, max_pending: 1 };
    let got = linear_write(
        path.clone(),
        Rearranger::Box,
        IoType::ClassicParallel,
        Some((CommType::P2p, FcDirection::Both, fc)),
    );
    for (r, back) in got.iter().enumerate() {
        let want: Vec<i32> = (0..4).map(|i| (r * 4 + i) as i32).collect();
        assert_eq!(back, &want);
    }
    assert_eq!(raw_data_section(&path), le_i32s(0..16));
}

#[test]
fn user_pinned_io_regions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pinned.par").to_string_lossy().into_owned();
    let path_in = path.clone();
    let got = run_ranks(2, move |comm| {
        let r = comm.rank();
        let ctx = PioContext::new();
        // Leave the blocksize at its default: with pinned regions the
        // splitter never runs and every IO task participates anyway.
        let iosysid = ctx.init_intracomm(comm, 2, 1, 0, Rearranger::Box).unwrap();
        let map: Vec<u64> = (1..=4).map(|i| (r * 4 + i) as u64).collect();
        let (start, count) = ([r * 4], [4usize]);
        let ioid = ctx
            .init_decomp(iosysid, PioType::Int, &[8], &map, None, Some(&start[..]), Some(&count[..]))
            .unwrap();
        assert_eq!(ctx.decomp(ioid).unwrap().num_aiotasks(), 2);

        let ncid = ctx
            .create_file(iosysid, &path_in, CreateMode::Clobber, IoType::ClassicParallel)
            .unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(8)).unwrap();
        let v = ctx.def_var(ncid, "data", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();
        let vals: Vec<i32> = (0..4).map(|i| (r * 4 + i) as i32).collect();
        ctx.write_darray(ncid, v, ioid, &vals, None).unwrap();
        ctx.sync(ncid).unwrap();
        let mut back = vec![0i32; 4];
        ctx.read_darray(ncid, v, ioid, &mut back).unwrap();
        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, ioid).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
        back
    });
    for (r, back) in got.iter().enumerate() {
        let want: Vec<i32> = (0..4).map(|i| (r * 4 + i) as i32).collect();
        assert_eq!(back, &want);
    }
    assert_eq!(raw_data_section(&path), le_i32s(0..8));
}

#[test]
fn unsorted_map_uses_the_permutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("perm.par").to_string_lossy().into_owned();
    let path_in = path.clone();
    let got = run_ranks(2, move |comm| {
        let r = comm.rank();
        let ctx = PioContext::new();
        ctx.set_blocksize(4).unwrap();
        let iosysid = ctx.init_intracomm(comm, 2, 1, 0, Rearranger::Box).unwrap();
        // Rank 0 owns {4,1,3,2}, rank 1 owns {8,5,7,6}: descending-ish.
        let map: Vec<u64> = if r == 0 { vec![4, 1, 3, 2] } else { vec![8, 5, 7, 6] };
        let ioid = ctx
            .init_decomp(iosysid, PioType::Int, &[8], &map, None, None, None)
            .unwrap();
        assert!(ctx.decomp(ioid).unwrap().map().windows(2).all(|w| w[0] <= w[1]));

        let ncid = ctx
            .create_file(iosysid, &path_in, CreateMode::Clobber, IoType::ClassicParallel)
            .unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(8)).unwrap();
        let v = ctx.def_var(ncid, "data", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();

        // Element i of the local array belongs at global offset map[i]-1;
        // write the global offset as the value so the file must come out
        // as 0..7 if the permutation is honored.
        let vals: Vec<i32> = map.iter().map(|&m| m as i32 - 1).collect();
        ctx.write_darray(ncid, v, ioid, &vals, None).unwrap();
        ctx.sync(ncid).unwrap();

        let mut back = vec![-1i32; 4];
        ctx.read_darray(ncid, v, ioid, &mut back).unwrap();
        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, ioid).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
        (vals, back)
    });
    for (vals, back) in &got {
        assert_eq!(back, vals, "read returns values in the caller's order");
    }
    assert_eq!(raw_data_section(&path), le_i32s(0..8));
}
