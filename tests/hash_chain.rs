use otcnode::monitoring::checkpoint::verify_checkpoints;
use otcnode::monitoring::state_hash::build_chain;
use otcnode::monitoring::Checkpoint;

fn states(count: u32) -> Vec<(u32, Vec<u8>)> {
    (0..count)
        .map(|i| (100 + i, format!("dao-state-{}", i).into_bytes()))
        .collect()
}

fn chain_of(states: &[(u32, Vec<u8>)]) -> Vec<otcnode::monitoring::StateHash> {
    build_chain(states.iter().map(|(h, s)| (*h, s.as_slice())))
}

#[test]
fn identical_histories_give_identical_chains() {
    let a = chain_of(&states(20));
    let b = chain_of(&states(20));
    assert_eq!(a, b);
    assert_eq!(a.len(), 20);
    assert_eq!(a.first().map(|h| h.height), Some(100));
}

#[test]
fn changed_state_diverges_from_that_height_on() {
    let honest = chain_of(&states(20));
    let mut tampered_states = states(20);
    tampered_states[7].1[0] ^= 0x01;
    let tampered = chain_of(&tampered_states);

    for (ours, theirs) in honest.iter().zip(tampered.iter()) {
        assert_eq!(ours.height, theirs.height);
        if ours.height < 107 {
            assert_eq!(ours.hash, theirs.hash, "height {}", ours.height);
        } else {
            assert_ne!(ours.hash, theirs.hash, "height {}", ours.height);
        }
    }
}

#[test]
fn checkpoint_catches_tampered_history() {
    let honest = chain_of(&states(20));
    let checkpoint = Checkpoint {
        height: 110,
        hash: honest[10].hash,
    };
    assert_eq!(verify_checkpoints(&honest, std::slice::from_ref(&checkpoint)), Ok(1));

    let mut tampered_states = states(20);
    tampered_states[3].1.push(0);
    let tampered = chain_of(&tampered_states);
    assert_eq!(verify_checkpoints(&tampered, std::slice::from_ref(&checkpoint)), Err(checkpoint));
}
