//! Decomposition through the public API: node lists, counts and the arena
//! backed build.

use fftjit::core::decompose::{self, Decomposition, DecompositionNode};
use fftjit::GenerationSession;

#[test]
fn test_reference_list_for_128() {
    let _ = env_logger::builder().is_test(true).try_init();

    let nodes: Vec<(usize, usize)> = decompose::elaborate(128, 8)
        .iter()
        .map(|node| (node.size, node.offset))
        .collect();
    assert_eq!(
        nodes,
        vec![
            (32, 0),
            (16, 32),
            (16, 48),
            (32, 64),
            (32, 96),
            (128, 0),
        ]
    );
}

#[test]
fn test_nodes_are_post_order() {
    let _ = env_logger::builder().is_test(true).try_init();

    let nodes = decompose::elaborate(4096, 8);
    for (i, node) in nodes.iter().enumerate() {
        // ancestors come after their descendants
        for earlier in &nodes[..i] {
            let contains = earlier.offset <= node.offset
                && node.offset + node.size <= earlier.offset + earlier.size
                && earlier.size > node.size;
            assert!(!contains, "{:?} listed before its descendant {:?}", earlier, node);
        }
    }
    assert_eq!(nodes.last(), Some(&DecompositionNode::new(4096, 0)));
}

#[test]
fn test_count_grows_with_size() {
    let _ = env_logger::builder().is_test(true).try_init();

    assert_eq!(decompose::count(16, 8), 1);
    assert_eq!(decompose::count(32, 8), 1);
    assert_eq!(decompose::count(64, 8), 4);
    let mut previous = 0;
    for log_n in 4..=20 {
        let count = decompose::count(1 << log_n, 8);
        assert!(count >= previous);
        previous = count;
    }
}

#[test]
fn test_manual_buffer_is_filled_exactly() {
    let _ = env_logger::builder().is_test(true).try_init();

    let n = 2048;
    let mut out = vec![DecompositionNode::SENTINEL; decompose::count(n, 4) + 1];
    let mut cursor = 0;
    let written = decompose::decompose(n, 4, 0, &mut out, &mut cursor);

    assert_eq!(written, out.len() - 1);
    assert_eq!(cursor, written);
    assert!(out[written].is_sentinel());
}

#[test]
fn test_session_reuse_after_reset() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut session = GenerationSession::new();
    {
        let decomposition = Decomposition::build(&session, 1 << 16, 8).unwrap();
        assert_eq!(decomposition.len(), decompose::count(1 << 16, 8));
    }
    assert!(session.memory_used() > 0);
    session.reset();

    let decomposition = Decomposition::build(&session, 64, 8).unwrap();
    assert_eq!(decomposition.internal(), decompose::elaborate(64, 8).as_slice());
}
