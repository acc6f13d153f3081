use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail};
use crossbeam_channel::{Receiver, unbounded};
use reactive_store::{Change, Store, StoreConfig, SubscriptionBag};
use tracing::{info, trace};

pub(crate) fn scenario(config: &StoreConfig) -> anyhow::Result<()> {
    let store = Store::with_config(0, config);
    let (sender, receiver) = unbounded::<Change<i32>>();
    let _token = store.subscribe(None, true, move |change| {
        let _ = sender.send(change.clone());
    });
    print_changes("subscribe", &receiver);

    store.update(|value| *value = 5);
    print_changes("update to 5", &receiver);

    store.update(|value| *value = 5);
    print_changes("update to 5 again", &receiver);

    println!("value: {}, version: {}", store.value(), store.version());
    Ok(())
}

fn print_changes(step: &str, receiver: &Receiver<Change<i32>>) {
    let changes: Vec<String> = receiver
        .try_iter()
        .map(|change| format!("{} -> {}", change.old, change.new))
        .collect();
    match changes.is_empty() {
        true => println!("{}: no notification", step),
        false => println!("{}: {}", step, changes.join(", ")),
    }
}

pub(crate) fn stress(config: &StoreConfig, threads: usize, iterations: usize) -> anyhow::Result<()> {
    if threads == 0 {
        bail!("At least one writer thread is required");
    }

    let store = Store::with_config(0usize, config);
    let notifications = Arc::new(AtomicUsize::new(0));
    let _token = {
        let notifications = notifications.clone();
        store.subscribe(None, false, move |_| {
            notifications.fetch_add(1, Ordering::Relaxed);
        })
    };

    info!("Starting writers. threads: {}, iterations: {}, mode: {:?}", threads, iterations, store.lock_mode());
    let barrier = Arc::new(Barrier::new(threads));
    let started_at = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|index| {
            let store = store.clone();
            let barrier = barrier.clone();
            thread::Builder::new()
                .name(format!("writer-{}", index))
                .spawn(move || {
                    barrier.wait();
                    for _ in 0..iterations {
                        store.update(|value| *value += 1);
                    }
                    trace!("Writer finished. index: {}", index);
                })
        })
        .collect::<Result<_, _>>()?;

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow!("Writer thread panicked"))?;
    }
    info!("Writers finished. elapsed: {:?}", started_at.elapsed());

    let expected = threads * iterations;
    let value = store.value();
    println!("mode: {:?}", store.lock_mode());
    println!("value: {}, expected: {}", value, expected);
    println!("notifications: {}", notifications.load(Ordering::Relaxed));

    if value != expected {
        bail!("Lost updates. value: {}, expected: {}", value, expected);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Axes {
    x: i32,
    y: i32,
}

pub(crate) fn scopes(config: &StoreConfig) -> anyhow::Result<()> {
    let store = Store::with_config(Axes::default(), config);
    let x = store
        .scope_builder(|axes| axes.x, |axes, x| axes.x = x)
        .filter(|x| *x >= 0)
        .named("x")
        .build();
    let y = store
        .scope_builder(|axes| axes.y, |axes, y| axes.y = y)
        .named("y")
        .build();

    let (sender, receiver) = unbounded::<&'static str>();
    let mut bag = SubscriptionBag::new();
    for (name, sender) in [("root", sender.clone()), ("x", sender.clone()), ("y", sender)] {
        let callback = move || {
            let _ = sender.send(name);
        };
        let token = match name {
            "root" => store.subscribe(None, false, move |_| callback()),
            "x" => x.subscribe(None, false, move |_| callback()),
            _ => y.subscribe(None, false, move |_| callback()),
        };
        bag.insert(token);
    }

    x.set(10);
    print_fired("x = 10", &receiver);

    x.set(-1);
    print_fired("x = -1 (rejected by filter)", &receiver);

    y.set(3);
    print_fired("y = 3", &receiver);

    store.update(|axes| axes.x = 10);
    print_fired("root x = 10 (unchanged)", &receiver);

    println!("value: {:?}", store.value());
    Ok(())
}

fn print_fired(step: &str, receiver: &Receiver<&'static str>) {
    let fired: Vec<&str> = receiver.try_iter().collect();
    match fired.is_empty() {
        true => println!("{}: none", step),
        false => println!("{}: {}", step, fired.join(", ")),
    }
}
