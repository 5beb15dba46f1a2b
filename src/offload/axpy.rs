//! `z = a * x + y` over `n` doubles in global memory.
//!
//! Each cluster takes a contiguous share of the vectors. Its DM core stages
//! `x` and `y` into TCDM, the compute cores split the share element-wise,
//! and the DM core writes `z` back.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{Job, JobFrame};
use crate::machine::CoreContext;
use crate::memory::MemoryError;

pub const AXPY_JOB_ID: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AxpyArgs {
    pub n: u32,
    pub _reserved: u32,
    pub a: f64,
    pub x_ptr: u64,
    pub y_ptr: u64,
    pub z_ptr: u64,
}

/// One cluster's share and where it sits in TCDM.
#[derive(Debug, Clone, Copy)]
struct Share {
    /// First element of the share.
    first: u64,
    len: u64,
    x: u64,
    y: u64,
    z: u64,
}

impl Share {
    fn bytes(&self) -> u64 {
        self.len * 8
    }
}

#[derive(Debug, Default)]
pub struct AxpyJob;

impl AxpyJob {
    /// Arguments and this cluster's share, identical on every core of the
    /// cluster. `None` leaves the cluster idle for this job.
    fn share(ctx: &CoreContext, frame: &JobFrame) -> Option<(AxpyArgs, Share)> {
        let args: AxpyArgs = match frame.read_args(ctx.memory()) {
            Ok(args) => args,
            Err(e) => {
                log::error!("{}: bad axpy arguments: {}", ctx.identity(), e);
                return None;
            }
        };

        let clusters = ctx.topology().cluster_count() as u64;
        let cluster = ctx.identity().cluster_id as u64;
        let n = args.n as u64;
        let first = n * cluster / clusters;
        let len = n * (cluster + 1) / clusters - first;
        if len == 0 {
            return None;
        }

        let x = frame.scratch_base();
        let share = Share {
            first,
            len,
            x,
            y: x + len * 8,
            z: x + 2 * len * 8,
        };
        if share.z + share.bytes() > ctx.l1().region().end() {
            log::error!(
                "{}: axpy share of {} elements does not fit in TCDM",
                ctx.identity(),
                len
            );
            return None;
        }
        Some((args, share))
    }

    fn compute(ctx: &CoreContext, args: &AxpyArgs, share: &Share) -> Result<(), MemoryError> {
        let memory = ctx.memory();
        let workers = ctx.topology().compute_cores_per_cluster() as usize;
        let me = ctx.identity().core_in_cluster as u64;
        for i in (me..share.len).step_by(workers) {
            let x = memory.read_f64(share.x + i * 8)?;
            let y = memory.read_f64(share.y + i * 8)?;
            memory.write_f64(share.z + i * 8, args.a * x + y)?;
        }
        Ok(())
    }
}

impl Job for AxpyJob {
    fn name(&self) -> &str {
        "axpy"
    }

    fn run_dm(&self, ctx: &CoreContext, frame: &JobFrame) {
        // Without the reservation nothing is staged or written back; the
        // barriers are still taken.
        let share = Self::share(ctx, frame).filter(|(_, share)| {
            match ctx.l1().alloc(3 * share.bytes()) {
                Ok(_) => true,
                Err(e) => {
                    log::error!("{}: axpy share not staged: {}", ctx.identity(), e);
                    false
                }
            }
        });
        if let Some((args, share)) = &share {
            let offset = share.first * 8;
            let dma = ctx.dma();
            dma.start_1d(share.x, args.x_ptr + offset, share.bytes() as usize);
            dma.start_1d(share.y, args.y_ptr + offset, share.bytes() as usize);
            dma.wait_all();
        }
        // Inputs staged
        ctx.cluster_hw_barrier();
        // Results computed
        ctx.cluster_hw_barrier();

        if let Some((args, share)) = &share {
            let dma = ctx.dma();
            dma.start_1d(args.z_ptr + share.first * 8, share.z, share.bytes() as usize);
            dma.wait_all();
        }
    }

    fn run_compute(&self, ctx: &CoreContext, frame: &JobFrame) {
        let share = Self::share(ctx, frame);
        ctx.cluster_hw_barrier();
        if let Some((args, share)) = &share {
            if let Err(e) = Self::compute(ctx, args, share) {
                log::error!("{}: axpy aborted: {}", ctx.identity(), e);
            }
        }
        ctx.cluster_hw_barrier();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::test_machine;
    use crate::offload::{run_job_loop, JobHeader, JobTable};
    use crate::topology::TopologyConfig;

    fn axpy_on(topology: TopologyConfig, n: u32) {
        let machine = test_machine(topology);
        let mut table = JobTable::new();
        table.register(AXPY_JOB_ID, AxpyJob);

        let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let y: Vec<f64> = (0..n).map(|i| 100.0 - i as f64).collect();
        let (z, _) = machine.run_with_host(
            |ctx| run_job_loop(ctx, &table),
            |host| {
                host.wait_for_device();
                let args = AxpyArgs {
                    n,
                    a: 3.0,
                    x_ptr: host.upload(&x).unwrap(),
                    y_ptr: host.upload(&y).unwrap(),
                    z_ptr: host.upload(&vec![0.0f64; n as usize]).unwrap(),
                    ..Default::default()
                };
                host.offload(AXPY_JOB_ID, &args).unwrap();
                let z: Vec<f64> = host.download(args.z_ptr, n as usize).unwrap();
                host.shutdown();
                z
            },
        );

        for i in 0..n as usize {
            assert_eq!(z[i], 3.0 * x[i] + y[i], "element {}", i);
        }
    }

    #[test]
    fn test_axpy_single_cluster() {
        axpy_on(TopologyConfig::new(5, 1, 1, 1), 37);
    }

    #[test]
    fn test_axpy_across_clusters() {
        axpy_on(TopologyConfig::new(3, 2, 2, 1), 101);
    }

    #[test]
    fn test_unreserved_share_leaves_result_untouched() {
        let machine = test_machine(TopologyConfig::new(3, 1, 1, 1));
        let memory = machine.memory();
        let l1 = machine.cluster(0).l1();
        let l3 = machine.global().l3();

        let n = 4u32;
        let bytes = n as u64 * 8;
        let args = AxpyArgs {
            n,
            a: 2.0,
            x_ptr: l3.alloc(bytes).unwrap(),
            y_ptr: l3.alloc(bytes).unwrap(),
            z_ptr: l3.alloc(bytes).unwrap(),
            ..Default::default()
        };
        memory.write_slice(args.x_ptr, &[1.0f64; 4]).unwrap();
        memory.write_slice(args.y_ptr, &[1.0f64; 4]).unwrap();
        memory.write_slice(args.z_ptr, &[-1.0f64; 4]).unwrap();

        let header = JobHeader {
            id: AXPY_JOB_ID,
            args_size: std::mem::size_of::<AxpyArgs>() as u32,
        };
        let local = l1.next();
        memory.write_obj(local, &header).unwrap();
        memory.write_obj(local + JobHeader::SIZE, &args).unwrap();
        let frame = JobFrame { header, remote: 0, local };
        l1.alloc(header.record_size()).unwrap();
        // Leave one granule less than the three vectors need
        l1.alloc(l1.allocator().available() - 3 * bytes + 8).unwrap();

        machine.run(|ctx| {
            if ctx.identity().is_dm() {
                AxpyJob.run_dm(ctx, &frame);
            } else {
                AxpyJob.run_compute(ctx, &frame);
            }
        });

        assert_eq!(memory.read_slice::<f64>(args.z_ptr, 4).unwrap(), vec![-1.0; 4]);
        assert_eq!(machine.cluster(0).dma().lifetime_stats().transfers, 0);
    }

    #[test]
    fn test_axpy_fewer_elements_than_clusters() {
        // Clusters with an empty share still take every barrier
        axpy_on(TopologyConfig::new(3, 4, 1, 1), 2);
    }
}
