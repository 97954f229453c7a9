// precomputed voting-set families for the quorum protocols
// every family must satisfy, for a cluster of n nodes:
//   1. i is a member of its own set
//   2. any two sets intersect
//   3. every set has the same size K
//   4. every node appears in exactly K sets
// the n = 3 and n = 7 families are the classic sqrt(N) constructions; n = 1
// and n = 2 make single- and two-node clusters work with the same machinery.
// `validate` re-checks the properties at startup for whichever n is
// configured, so a future family cannot be added on inspection alone

use crate::NodeId;

static N1: [&[NodeId]; 1] = [&[1]];
static N2: [&[NodeId]; 2] = [&[1, 2], &[1, 2]];
static N3: [&[NodeId]; 3] = [&[1, 2], &[2, 3], &[1, 3]];
static N7: [&[NodeId]; 7] = [
    &[1, 2, 3],
    &[2, 4, 6],
    &[3, 5, 6],
    &[1, 4, 5],
    &[2, 5, 7],
    &[1, 6, 7],
    &[3, 4, 7],
];

/// Voting sets for a cluster of `num_node` nodes, indexed by node id minus
/// one. `None` when no family is configured for that cluster size.
pub fn family(num_node: u8) -> Option<&'static [&'static [NodeId]]> {
    match num_node {
        1 => Some(&N1),
        2 => Some(&N2),
        3 => Some(&N3),
        7 => Some(&N7),
        _ => None,
    }
}

/// The voting set of `id` in a cluster of `num_node` nodes.
pub fn members(num_node: u8, id: NodeId) -> anyhow::Result<&'static [NodeId]> {
    anyhow::ensure!(
        (1..=num_node).contains(&id),
        "node id {id} out of 1..={num_node}"
    );
    let family = family(num_node)
        .ok_or(anyhow::anyhow!("no voting sets for {num_node} node cluster"))?;
    Ok(family[id as usize - 1])
}

pub fn validate(num_node: u8, family: &[&[NodeId]]) -> anyhow::Result<()> {
    anyhow::ensure!(num_node >= 1, "cluster needs at least one node");
    anyhow::ensure!(
        family.len() == num_node as usize,
        "family has {} sets for {num_node} nodes",
        family.len()
    );
    let quorum = family[0].len();
    for (index, members) in family.iter().enumerate() {
        let id = index as NodeId + 1;
        anyhow::ensure!(
            members.len() == quorum,
            "voting set of node {id} has {} members, expected {quorum}",
            members.len()
        );
        anyhow::ensure!(
            members.iter().all(|peer| (1..=num_node).contains(peer)),
            "voting set of node {id} names a node outside the cluster"
        );
        anyhow::ensure!(
            members.contains(&id),
            "node {id} is missing from its own voting set"
        )
    }
    for (index, members) in family.iter().enumerate() {
        for (other_index, other_members) in family.iter().enumerate().skip(index + 1) {
            anyhow::ensure!(
                members.iter().any(|peer| other_members.contains(peer)),
                "voting sets of node {} and node {} do not intersect",
                index + 1,
                other_index + 1
            )
        }
    }
    for id in 1..=num_node {
        let appearances = family
            .iter()
            .filter(|members| members.contains(&id))
            .count();
        anyhow::ensure!(
            appearances == quorum,
            "node {id} appears in {appearances} sets, expected {quorum}"
        )
    }
    Ok(())
}
