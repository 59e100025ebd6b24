//! Record (unlimited-dimension) variables through the darray path:
//! setframe/advanceframe steer which record a write lands in.

mod util;

use pario::prelude::*;
use util::run_ranks;

#[test]
fn records_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.par").to_string_lossy().into_owned();
    let got = run_ranks(2, move |comm| {
        let r = comm.rank();
        let ctx = PioContext::new();
        ctx.set_blocksize(3).unwrap();
        let iosysid = ctx.init_intracomm(comm, 2, 1, 0, Rearranger::Box).unwrap();
        let map: Vec<u64> = if r == 0 { vec![1, 2, 3] } else { vec![4, 5, 6] };
        let ioid = ctx
            .init_decomp(iosysid, PioType::Double, &[6], &map, None, None, None)
            .unwrap();

        let ncid = ctx
            .create_file(iosysid, &path, CreateMode::Clobber, IoType::ClassicParallel)
            .unwrap();
        let t = ctx.def_dim(ncid, "time", DimLen::Unlimited).unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(6)).unwrap();
        let v = ctx.def_var(ncid, "field", PioType::Double, &[t, x]).unwrap();
        ctx.enddef(ncid).unwrap();

        for rec in 0..3 {
            ctx.setframe(ncid, v, rec).unwrap();
            let vals: Vec<f64> = map.iter().map(|&m| (rec * 10) as f64 + m as f64).collect();
            ctx.write_darray(ncid, v, ioid, &vals, None).unwrap();
            ctx.sync(ncid).unwrap();
        }
        assert_eq!(ctx.inq_dimlen(ncid, t).unwrap(), 3);

        // Read record 1 back.
        ctx.setframe(ncid, v, 1).unwrap();
        let mut back = vec![0f64; 3];
        ctx.read_darray(ncid, v, ioid, &mut back).unwrap();

        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, ioid).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
        back
    });
    assert_eq!(got[0], vec![11.0, 12.0, 13.0]);
    assert_eq!(got[1], vec![14.0, 15.0, 16.0]);
}

#[test]
fn advanceframe_moves_the_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adv.par").to_string_lossy().into_owned();
    run_ranks(1, move |comm| {
        let ctx = PioContext::new();
        let iosysid = ctx.init_intracomm(comm, 1, 1, 0, Rearranger::Subset).unwrap();
        let ioid = ctx
            .init_decomp(iosysid, PioType::Int, &[2], &[1, 2], None, None, None)
            .unwrap();
        let ncid = ctx
            .create_file(iosysid, &path, CreateMode::Clobber, IoType::Classic)
            .unwrap();
        let t = ctx.def_dim(ncid, "time", DimLen::Unlimited).unwrap();
        let x = ctx.def_dim(ncid, "x", DimLen::Fixed(2)).unwrap();
        let v = ctx.def_var(ncid, "counts", PioType::Int, &[t, x]).unwrap();
        let fixed = ctx.def_var(ncid, "static", PioType::Int, &[x]).unwrap();
        ctx.enddef(ncid).unwrap();

        ctx.write_darray(ncid, v, ioid, &[1i32, 2], None).unwrap();
        ctx.advanceframe(ncid, v).unwrap();
        ctx.write_darray(ncid, v, ioid, &[3i32, 4], None).unwrap();
        ctx.sync(ncid).unwrap();

        ctx.setframe(ncid, v, 0).unwrap();
        let mut rec0 = vec![0i32; 2];
        ctx.read_darray(ncid, v, ioid, &mut rec0).unwrap();
        assert_eq!(rec0, vec![1, 2]);
        ctx.setframe(ncid, v, 1).unwrap();
        let mut rec1 = vec![0i32; 2];
        ctx.read_darray(ncid, v, ioid, &mut rec1).unwrap();
        assert_eq!(rec1, vec![3, 4]);

        // Record control on a fixed var is rejected.
        let err = ctx.setframe(ncid, fixed, 0).unwrap_err();
        assert!(matches!(err, PioError::InvalidArg(_)));
        let err = ctx.advanceframe(ncid, fixed).unwrap_err();
        assert!(matches!(err, PioError::InvalidArg(_)));

        ctx.close_file(ncid).unwrap();
        ctx.free_decomp(iosysid, ioid).unwrap();
        ctx.free_iosystem(iosysid).unwrap();
    });
}
