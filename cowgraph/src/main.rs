use clap::Parser as ClapParser;
use log::info;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};

use cowgraph::{
    CollectorCreateInfo, Object, Shared, Trace, Visitor, collect_cycles, collector, configure,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of particles in the population
    #[arg(long, default_value_t = 32)]
    particles: usize,

    /// Number of propagate/resample steps
    #[arg(long, default_value_t = 16)]
    steps: usize,

    /// Seed for the resampling generator
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,

    #[arg(long, help = "Buffered candidates before an automatic collection")]
    threshold: Option<usize>,

    #[arg(long, help = "Collect cycles automatically once the threshold is hit")]
    auto_collect: bool,

    #[arg(long, help = "Give every state a self edge so histories form cycles")]
    cycles: bool,
}

/// One step of a particle's history.
#[derive(Default)]
struct State {
    value: Mutex<i64>,
    prev: Mutex<Shared<State>>,
    echo: Mutex<Shared<State>>,
}

impl Object for State {
    fn copy_object(&self) -> Self {
        Self {
            value: Mutex::new(*self.value.lock()),
            prev: Mutex::new(self.prev.lock().clone()),
            echo: Mutex::new(self.echo.lock().clone()),
        }
    }

    fn trace(&self, visitor: &mut dyn Visitor) {
        self.prev.trace(visitor);
        self.echo.trace(visitor);
    }
}

fn propagate(particle: &mut Shared<State>, delta: i64, cycles: bool) {
    let value = particle.read().map_or(0, |state| *state.value.lock());
    let state = State {
        value: Mutex::new(value + delta),
        prev: Mutex::new(particle.clone()),
        echo: Mutex::default(),
    };
    let next = Shared::new_in(state, particle.label());
    if cycles && let Some(state) = next.get() {
        *state.echo.lock() = next.clone();
    }
    particle.assign(&next);
}

fn history_len(particle: &Shared<State>) -> usize {
    let mut len = 0;
    let mut current = particle.clone();
    while let Some(state) = current.read() {
        len += 1;
        let prev = state.prev.lock().clone();
        current = prev;
    }
    len
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(err) = configure(CollectorCreateInfo {
        threshold: cli.threshold,
        auto_collect: Some(cli.auto_collect),
        ..Default::default()
    }) {
        eprintln!("invalid collector settings: {err}");
        std::process::exit(1);
    }

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut population: Vec<Shared<State>> = (0..cli.particles.max(1))
        .map(|_| Shared::new(State::default()))
        .collect();

    for step in 0..cli.steps {
        for particle in population.iter_mut() {
            let delta = rng.gen_range(-3..=3);
            propagate(particle, delta, cli.cycles);
        }

        // resample: every survivor is a lazy deep clone of its ancestor
        let ancestors: Vec<usize> = (0..population.len())
            .map(|_| rng.gen_range(0..population.len()))
            .collect();
        population = ancestors
            .iter()
            .map(|&ancestor| population[ancestor].deep_clone())
            .collect();

        let stats = collector::stats();
        info!(
            "step {step}: {} buffered candidates, {} collected so far",
            collector::candidate_count(),
            stats.collected
        );
    }

    for particle in &population {
        particle.finish();
    }
    let values: Vec<i64> = population
        .iter()
        .filter_map(|particle| particle.read().map(|state| *state.value.lock()))
        .collect();
    let longest = population.iter().map(history_len).max().unwrap_or(0);
    drop(population);

    let round = collect_cycles();
    let totals = collector::stats();
    println!("final values: {values:?}");
    println!("longest history: {longest}");
    println!(
        "last round: {} candidates, {} roots, {} collected",
        round.candidates, round.roots, round.collected
    );
    println!(
        "totals: {} rounds, {} candidates, {} collected",
        totals.rounds, totals.candidates, totals.collected
    );
}
