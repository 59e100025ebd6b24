//! Maps with duplicate offsets mark the decomposition read-only:
//! writes are rejected, reads fan the shared cell out to every task
//! that maps it.

mod util;

use pario::prelude::*;
use util::run_ranks;

#[test]
fn duplicate_map_is_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dup.par").to_string_lossy().into_owned();
    let got = run_ranks(2, move |comm| {
        let r = comm.rank();
        let ctx = PioContext::new();
        let iosysid = ctx.init_intracomm(comm, 1, 1, 0, Rearranger::Subset).unwrap();

        // Seed the file through a clean decomposition.
        let clean_map: Vec<u64> = if r == 0 { vec![1, 2] } else { vec![3, 4] };
        let clean = ctx
            .init_decomp(iosysid, PioType::Int, &[4], &clean_map, None, None, None)
            .unwrap();
        let ncid = ctx
            .create_file(iosysid, &path, CreateMode::Clobber, IoType::ClassicParallel)
            .unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(4)).unwrap();
        let v = ctx.def_var(ncid, "data", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();
        let seed: Vec<i32> = if r == 0 { vec![10, 20] } else { vec![30, 40] };
        ctx.write_darray(ncid, v, clean, &seed, None).unwrap();
        ctx.sync(ncid).unwrap();

        // Overlapping maps: offset 2 appears on both tasks.
        let dup_map: Vec<u64> = if r == 0 { vec![1, 2] } else { vec![2, 3] };
        let dup = ctx
            .init_decomp(iosysid, PioType::Int, &[4], &dup_map, None, None, None)
            .unwrap();
        assert!(ctx.decomp(dup).unwrap().read_only());

        let write_err = ctx
            .write_darray(ncid, v, dup, &[0i32, 0], None)
            .unwrap_err();
        assert_eq!(write_err, PioError::ReadOnlyDecomp);
        assert_eq!(write_err.code(), -505);

        let mut back = vec![0i32; 2];
        ctx.read_darray(ncid, v, dup, &mut back).unwrap();

        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, dup).unwrap();
        ctx.free_decomp(iosysid, clean).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
        back
    });
    // Both tasks see the stored values; the shared offset 2 reads the
    // same byte on each side.
    assert_eq!(got[0], vec![10, 20]);
    assert_eq!(got[1], vec![20, 30]);
}

#[test]
fn duplicates_within_one_task_are_detected() {
    run_ranks(2, |comm| {
        let ctx = PioContext::new();
        let iosysid = ctx.init_intracomm(comm, 2, 1, 0, Rearranger::Subset).unwrap();
        let r = ctx.iotask_rank(iosysid).unwrap().unwrap();
        let map: Vec<u64> = if r == 0 { vec![1, 1] } else { vec![2, 3] };
        let ioid = ctx
            .init_decomp(iosysid, PioType::Double, &[4], &map, None, None, None)
            .unwrap();
        assert!(ctx.decomp(ioid).unwrap().read_only());
        ctx.free_decomp(iosysid, ioid).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
    });
}
