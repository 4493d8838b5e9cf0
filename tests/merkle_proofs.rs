use routeforge::core::error::ForgeError;
use routeforge::core::hash::{Address, Digest, Selector};
use routeforge::core::merkle::{leaf_hash, verify, Direction, MerkleTree};

fn leaf(i: u8) -> Digest {
    let selector = Selector([i, 0, 0, 0]);
    let address = Address(Digest::of(&[i, 10]).0);
    let code_hash = Digest::of(&[i, 20]);
    leaf_hash(&selector, &address, &code_hash)
}

fn leaves(n: u8) -> Vec<Digest> {
    (0..n).map(leaf).collect()
}

#[test]
fn every_leaf_proves_against_the_true_root() {
    for n in 1..=9u8 {
        let leaves = leaves(n);
        let tree = MerkleTree::build(leaves.clone()).expect("build");
        for (i, leaf) in leaves.iter().enumerate() {
            let proof = tree.prove(i).expect("prove");
            assert!(
                verify(leaf, &proof, &tree.root()).expect("verify"),
                "leaf {} of {} failed against its own root",
                i,
                n
            );
        }
    }
}

#[test]
fn root_of_a_tree_differing_in_one_leaf_rejects_all_original_proofs() {
    for n in 2..=9u8 {
        let original = leaves(n);
        let tree = MerkleTree::build(original.clone()).expect("build");

        for tampered_index in 0..n as usize {
            let mut tampered = original.clone();
            tampered[tampered_index] = Digest::of(&[tampered_index as u8, 99]);
            let tampered_root = MerkleTree::build(tampered).expect("build").root();
            assert_ne!(tree.root(), tampered_root);

            // Proofs built for the original tree must not reach the
            // tampered root for the leaf they cover.
            let proof = tree.prove(tampered_index).expect("prove");
            assert!(!verify(&original[tampered_index], &proof, &tampered_root).expect("verify"));
        }
    }
}

#[test]
fn proof_for_one_index_does_not_verify_another_leaf() {
    let leaves = leaves(4);
    let tree = MerkleTree::build(leaves.clone()).expect("build");
    let proof_for_0 = tree.prove(0).expect("prove");
    assert!(!verify(&leaves[1], &proof_for_0, &tree.root()).expect("verify"));
}

#[test]
fn flipping_a_direction_bit_breaks_the_proof() {
    let leaves = leaves(5);
    let tree = MerkleTree::build(leaves.clone()).expect("build");
    for i in 0..leaves.len() {
        let mut proof = tree.prove(i).expect("prove");
        proof.directions[0] = match proof.directions[0] {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        };
        // Non-commutative hashing: the flipped proof may only still verify
        // where the sibling is the duplicated pad of the leaf itself.
        if proof.siblings[0] != leaves[i] {
            assert!(!verify(&leaves[i], &proof, &tree.root()).expect("verify"));
        }
    }
}

#[test]
fn length_mismatch_is_malformed_not_false() {
    let leaves = leaves(3);
    let tree = MerkleTree::build(leaves.clone()).expect("build");
    let mut proof = tree.prove(0).expect("prove");
    proof.siblings.pop();

    match verify(&leaves[0], &proof, &tree.root()) {
        Err(ForgeError::Validation(_)) => {}
        other => panic!("expected malformed-input error, got {:?}", other),
    }
}
