use locker::test_utils::create_test_lockers;
use proptest::prelude::*;
use std::time::Duration;

const NAMES: [&str; 3] = ["job-1", "job-7", "leader"];

#[derive(Debug, Clone)]
enum Step {
    Acquire { locker: usize, name: usize, secs: u64 },
    Release { locker: usize, name: usize },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..2usize, 0..NAMES.len(), 2..120u64)
            .prop_map(|(locker, name, secs)| Step::Acquire { locker, name, secs }),
        (0..2usize, 0..NAMES.len()).prop_map(|(locker, name)| Step::Release { locker, name }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_at_most_one_holder_per_name(steps in prop::collection::vec(step(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let cluster = create_test_lockers(2).unwrap();

            for step in steps {
                match step {
                    Step::Acquire { locker, name, secs } => {
                        cluster.lockers[locker]
                            .acquire(NAMES[name], Duration::from_secs(secs))
                            .await
                            .unwrap();
                    }
                    Step::Release { locker, name } => cluster.lockers[locker].release(NAMES[name]),
                }

                let mut held = Vec::new();
                for locker in &cluster.lockers {
                    held.push(locker.held_locks().await.unwrap());
                }

                for name in NAMES {
                    let holders: Vec<usize> = held
                        .iter()
                        .enumerate()
                        .filter(|(_, locks)| locks.iter().any(|lock| lock.name == name))
                        .map(|(index, _)| index)
                        .collect();
                    assert!(holders.len() <= 1, "{name} held by {holders:?}");

                    let record = cluster.memory.get("locks", name);
                    match holders.first() {
                        Some(&index) => {
                            let record = record.expect("held lock has a record");
                            assert_eq!(record.owner, cluster.lockers[index].id().to_string());
                        }
                        None => assert!(record.is_none(), "{name} has an orphaned record"),
                    }
                }
            }

            cluster.shutdown().await;
            assert!(cluster.memory.is_empty());
        });
    }
}
