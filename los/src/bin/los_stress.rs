use clap::{Parser as ClapParser, ValueEnum};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::process;

use los::{
    AllocError, LargeObjectSpace, SpaceKind, SpaceSettings, SweepResult,
    create_space,
};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Map,
    FreeList,
}

impl From<Kind> for SpaceKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Map => SpaceKind::Map,
            Kind::FreeList => SpaceKind::FreeList,
        }
    }
}

/// Random large object workload with periodic mark and sweep.
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Kind::FreeList, help = "Allocation strategy")]
    kind: Kind,

    #[arg(long, default_value_t = 64 * 1024 * 1024, help = "Free list capacity in bytes")]
    capacity: usize,

    #[arg(long, default_value_t = 4096, help = "Free list slot alignment")]
    alignment: usize,

    #[arg(long, default_value_t = 10_000, help = "Number of workload steps")]
    iterations: usize,

    #[arg(long, default_value_t = 256 * 1024, help = "Largest object size in bytes")]
    max_object_size: usize,

    #[arg(long, default_value_t = 0x9e37_79b9_7f4a_7c15, help = "Workload seed")]
    seed: u64,

    /// Only meaningful for the map space
    #[arg(long, help = "Surround objects with inaccessible pages")]
    guard_pages: bool,

    #[arg(long, help = "Print the space layout at the end")]
    dump: bool,

    #[arg(long, help = "Disable containment checks and page protection")]
    no_debug_checks: bool,
}

#[derive(Default)]
struct Totals {
    allocs: usize,
    frees: usize,
    failed: usize,
    collections: usize,
    swept: SweepResult,
}

/// Object start and usable size.
type LiveObject = (usize, usize);

/// Marks a random half of `live`, sweeps the rest and keeps the survivors.
/// Every other cycle swaps the bitmaps before sweeping.
fn collect(
    space: &dyn LargeObjectSpace,
    live: &mut Vec<LiveObject>,
    rng: &mut StdRng,
    totals: &mut Totals,
) {
    let swap = totals.collections % 2 == 1;
    totals.collections += 1;

    let mut survivors = Vec::with_capacity(live.len());
    {
        let mut mark = space.mark_bitmap_mut();
        mark.clear_all();
        for &obj in live.iter() {
            if rng.random_bool(0.5) {
                mark.set(obj.0 as *const u8);
                survivors.push(obj);
            }
        }
    }

    let freed = if swap {
        space.swap_bitmaps();
        let freed = space.sweep(true);
        space.mark_bitmap_mut().clear_all();
        freed
    } else {
        let freed = space.sweep(false);
        space.mark_bitmap_mut().clear_all();
        freed
    };

    log::info!(
        "collection {}: {} survivors, freed {} objects ({} bytes)",
        totals.collections,
        survivors.len(),
        freed.objects,
        freed.bytes
    );
    totals.swept += freed;
    *live = survivors;
}

fn touch(ptr: usize, usable: usize, value: u8) {
    if usable == 0 {
        return;
    }
    // SAFETY: both bytes lie inside the object's usable range
    unsafe {
        *(ptr as *mut u8) = value;
        *((ptr + usable - 1) as *mut u8) = value;
    }
}

fn run(space: &dyn LargeObjectSpace, cli: &Cli) -> Totals {
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut live: Vec<LiveObject> = Vec::new();
    let mut totals = Totals::default();

    for step in 0..cli.iterations {
        if step > 0 && step % 512 == 0 {
            collect(space, &mut live, &mut rng, &mut totals);
        }

        if live.is_empty() || rng.random_ratio(7, 10) {
            let size = rng.random_range(1..=cli.max_object_size.max(1));
            let result = match space.alloc(size) {
                Err(AllocError::OutOfSpace { .. }) => {
                    collect(space, &mut live, &mut rng, &mut totals);
                    space.alloc(size)
                }
                other => other,
            };
            match result {
                Ok(obj) => {
                    let ptr = obj.ptr.as_ptr();
                    touch(ptr as usize, obj.usable_size, step as u8);
                    space.live_bitmap_mut().set(ptr);
                    live.push((ptr as usize, obj.usable_size));
                    totals.allocs += 1;
                }
                Err(err) => {
                    totals.failed += 1;
                    let mut report = String::new();
                    let _ = space.log_fragmentation_alloc_failure(&mut report, size);
                    log::warn!("{err}: {report}");
                }
            }
        } else {
            let (ptr, _) = live.swap_remove(rng.random_range(0..live.len()));
            space.live_bitmap_mut().clear(ptr as *const u8);
            space.free(ptr as *mut u8);
            totals.frees += 1;
        }
    }
    totals
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .init();
    let cli = Cli::parse();

    let settings = SpaceSettings {
        kind: cli.kind.into(),
        capacity: cli.capacity,
        alignment: cli.alignment,
        guard_pages: cli.guard_pages,
        debug_checks: !cli.no_debug_checks,
        ..SpaceSettings::default()
    };
    let space = match create_space("stress large object space", &settings) {
        Ok(space) => space,
        Err(err) => {
            eprintln!("Error creating space: {err}");
            process::exit(1);
        }
    };

    let totals = run(space.as_ref(), &cli);

    println!("== {} ==", space.name());
    println!("allocations:      {}", totals.allocs);
    println!("explicit frees:   {}", totals.frees);
    println!("failed allocs:    {}", totals.failed);
    println!("collections:      {}", totals.collections);
    println!(
        "swept:            {} objects, {} bytes",
        totals.swept.objects, totals.swept.bytes
    );
    println!(
        "live:             {} objects, {} bytes",
        space.objects_allocated(),
        space.bytes_allocated()
    );
    println!(
        "lifetime:         {} objects, {} bytes",
        space.total_objects_allocated(),
        space.total_bytes_allocated()
    );

    if cli.dump {
        let mut out = String::new();
        match space.dump(&mut out) {
            Ok(()) => print!("{out}"),
            Err(err) => eprintln!("Error dumping space: {err}"),
        }
    }
}
