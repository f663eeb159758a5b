//! Graph construction and validation.

use super::dataset::{CollectionConfig, DatasetConfig, EdgeDirection};
use crate::core::{CollectionAddress, FieldAddress, IdentitySeeds};
use crate::errors::{codes, GraphValidationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A value-flow edge: rows of `from`'s collection provide the values used
/// to query `to`'s collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    /// The providing field.
    pub from: FieldAddress,
    /// The queried field.
    pub to: FieldAddress,
}

/// One vertex of a frozen traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalNode {
    /// The collection address.
    pub address: CollectionAddress,
    /// Connector serving the collection.
    pub connection_key: String,
    /// Collection definition snapshot.
    pub collection: CollectionConfig,
    /// Edges feeding this node.
    pub incoming: Vec<Edge>,
    /// Edges leaving this node.
    pub outgoing: Vec<Edge>,
    /// Seeded identity fields as `(path, identity type)`.
    pub identity_fields: Vec<(String, String)>,
    /// Collections that must finish before this one.
    pub upstream: BTreeSet<CollectionAddress>,
    /// Collections waiting on this one.
    pub downstream: BTreeSet<CollectionAddress>,
}

impl TraversalNode {
    /// Returns true if identity seeds alone can query this node.
    #[must_use]
    pub fn is_root(&self) -> bool {
        !self.identity_fields.is_empty()
    }
}

/// Erasure ordering derived from a traversal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErasureOrder {
    /// Nodes that must finish erasure before each node.
    pub upstream: BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>>,
    /// Inverse of `upstream`.
    pub downstream: BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>>,
    /// Deterministic topological order.
    pub order: Vec<CollectionAddress>,
}

/// A frozen, validated graph of collections for one request.
#[derive(Debug, Clone)]
pub struct Traversal {
    nodes: BTreeMap<CollectionAddress, TraversalNode>,
    order: Vec<CollectionAddress>,
}

struct Indexed<'a> {
    dataset: &'a DatasetConfig,
    collection: &'a CollectionConfig,
}

impl Traversal {
    /// Builds a traversal from dataset definitions and identity seeds.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphValidationError`] when a reference cannot be
    /// resolved, the graph has a cycle, no collection can be seeded, or a
    /// collection cannot be reached from the seeds.
    pub fn build(datasets: &[DatasetConfig], seeds: &IdentitySeeds) -> Result<Self, GraphValidationError> {
        let index = index_collections(datasets)?;
        let edges = resolve_edges(&index)?;

        let active: BTreeSet<&CollectionAddress> = index
            .iter()
            .filter(|(_, entry)| !entry.collection.skip_processing)
            .map(|(addr, _)| addr)
            .collect();
        let active_edges: Vec<&Edge> = edges
            .iter()
            .filter(|e| active.contains(&e.from.collection) && active.contains(&e.to.collection))
            .collect();

        // Upstream sets over the whole active graph, so cycles are reported
        // even when they also make collections unreachable.
        let mut upstream: BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>> =
            active.iter().map(|addr| ((*addr).clone(), BTreeSet::new())).collect();
        for edge in &active_edges {
            if let Some(set) = upstream.get_mut(&edge.to.collection) {
                set.insert(edge.from.collection.clone());
            }
        }
        for addr in &active {
            for after in &index[*addr].collection.after {
                if active.contains(after) {
                    if let Some(set) = upstream.get_mut(*addr) {
                        set.insert(after.clone());
                    }
                }
            }
        }

        if let Some(cycle) = find_cycle(&upstream) {
            return Err(GraphValidationError::cycle(
                cycle.iter().map(ToString::to_string).collect(),
            ));
        }

        let roots: BTreeMap<CollectionAddress, Vec<(String, String)>> = active
            .iter()
            .filter_map(|addr| {
                let seeded: Vec<(String, String)> = index[*addr]
                    .collection
                    .identity_fields()
                    .into_iter()
                    .filter(|(_, identity)| seeds.get(identity).is_some_and(|v| !v.is_null()))
                    .collect();
                (!seeded.is_empty()).then(|| ((*addr).clone(), seeded))
            })
            .collect();

        if roots.is_empty() {
            return Err(GraphValidationError::new(
                codes::NO_SEEDS,
                "No collection has an identity field matching the supplied identities",
            ));
        }

        let reached = reachable(roots.keys().cloned(), &active_edges);
        let unreachable: Vec<String> = active
            .iter()
            .filter(|addr| !reached.contains(**addr))
            .map(ToString::to_string)
            .collect();
        if !unreachable.is_empty() {
            return Err(GraphValidationError::unreachable(unreachable));
        }

        let mut nodes: BTreeMap<CollectionAddress, TraversalNode> = BTreeMap::new();
        for addr in &reached {
            let entry = &index[addr];
            nodes.insert(
                addr.clone(),
                TraversalNode {
                    address: addr.clone(),
                    connection_key: entry.dataset.connection_key.clone(),
                    collection: entry.collection.clone(),
                    incoming: active_edges
                        .iter()
                        .filter(|e| &e.to.collection == addr)
                        .map(|e| (*e).clone())
                        .collect(),
                    outgoing: active_edges
                        .iter()
                        .filter(|e| &e.from.collection == addr)
                        .map(|e| (*e).clone())
                        .collect(),
                    identity_fields: roots.get(addr).cloned().unwrap_or_default(),
                    upstream: upstream.get(addr).cloned().unwrap_or_default(),
                    downstream: BTreeSet::new(),
                },
            );
        }
        let links: Vec<(CollectionAddress, CollectionAddress)> = nodes
            .values()
            .flat_map(|n| n.upstream.iter().map(|up| (up.clone(), n.address.clone())))
            .collect();
        for (up, down) in links {
            if let Some(node) = nodes.get_mut(&up) {
                node.downstream.insert(down);
            }
        }

        let order = topological_sort(&nodes.iter().map(|(a, n)| (a.clone(), n.upstream.clone())).collect());

        tracing::debug!(
            nodes = nodes.len(),
            roots = roots.len(),
            "Built dataset traversal"
        );

        Ok(Self { nodes, order })
    }

    /// Returns a node by address.
    #[must_use]
    pub fn node(&self, address: &CollectionAddress) -> Option<&TraversalNode> {
        self.nodes.get(address)
    }

    /// Iterates nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &TraversalNode> {
        self.order.iter().filter_map(|addr| self.nodes.get(addr))
    }

    /// Returns the deterministic topological order.
    #[must_use]
    pub fn topological_order(&self) -> &[CollectionAddress] {
        &self.order
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the traversal has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Computes the erasure ordering.
    ///
    /// A node is erased only after every node that reads its values through
    /// a reference, and after its `erase_after` declarations.
    pub fn erasure_order(&self) -> Result<ErasureOrder, GraphValidationError> {
        let mut upstream: BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>> = BTreeMap::new();
        for (addr, node) in &self.nodes {
            let readers = node
                .outgoing
                .iter()
                .map(|e| e.to.collection.clone())
                .filter(|reader| reader != addr);
            let declared = node
                .collection
                .erase_after
                .iter()
                .filter(|a| self.nodes.contains_key(*a))
                .cloned();
            upstream.insert(addr.clone(), readers.chain(declared).collect());
        }

        if let Some(cycle) = find_cycle(&upstream) {
            return Err(GraphValidationError::cycle(
                cycle.iter().map(ToString::to_string).collect(),
            ));
        }

        let mut downstream: BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>> =
            upstream.keys().map(|a| (a.clone(), BTreeSet::new())).collect();
        for (addr, ups) in &upstream {
            for up in ups {
                if let Some(set) = downstream.get_mut(up) {
                    set.insert(addr.clone());
                }
            }
        }

        let order = topological_sort(&upstream);
        Ok(ErasureOrder {
            upstream,
            downstream,
            order,
        })
    }
}

fn index_collections(
    datasets: &[DatasetConfig],
) -> Result<BTreeMap<CollectionAddress, Indexed<'_>>, GraphValidationError> {
    let mut index = BTreeMap::new();
    for dataset in datasets {
        for collection in &dataset.collections {
            let addr = dataset.address(&collection.name);
            if index.contains_key(&addr) {
                return Err(GraphValidationError::new(
                    codes::DUPLICATE,
                    format!("Collection '{addr}' is defined more than once"),
                )
                .with_collections(vec![addr.to_string()]));
            }
            index.insert(addr, Indexed { dataset, collection });
        }
    }
    Ok(index)
}

fn resolve_edges(index: &BTreeMap<CollectionAddress, Indexed<'_>>) -> Result<Vec<Edge>, GraphValidationError> {
    let mut edges = BTreeSet::new();
    for (addr, entry) in index {
        for declared in entry.collection.after.iter().chain(&entry.collection.erase_after) {
            if !index.contains_key(declared) {
                return Err(GraphValidationError::unresolved_reference(
                    addr.to_string(),
                    declared.to_string(),
                ));
            }
        }

        for (path, field) in entry.collection.flattened_fields() {
            let local = addr.field(&path);
            for reference in &field.references {
                let target = reference.target().and_then(|(collection, target_path)| {
                    let target_addr = CollectionAddress::new(&reference.dataset, collection);
                    index
                        .get(&target_addr)
                        .and_then(|t| t.collection.field(target_path))
                        .map(|_| target_addr.field(target_path))
                });
                let Some(remote) = target else {
                    return Err(GraphValidationError::unresolved_reference(
                        local.to_string(),
                        format!("{}:{}", reference.dataset, reference.field),
                    ));
                };
                let edge = match reference.direction {
                    EdgeDirection::From => Edge {
                        from: remote,
                        to: local.clone(),
                    },
                    EdgeDirection::To => Edge {
                        from: local.clone(),
                        to: remote,
                    },
                };
                edges.insert(edge);
            }
        }
    }
    Ok(edges.into_iter().collect())
}

fn reachable(
    roots: impl Iterator<Item = CollectionAddress>,
    edges: &[&Edge],
) -> BTreeSet<CollectionAddress> {
    let mut reached: BTreeSet<CollectionAddress> = BTreeSet::new();
    let mut queue: VecDeque<CollectionAddress> = VecDeque::new();
    for root in roots {
        if reached.insert(root.clone()) {
            queue.push_back(root);
        }
    }
    while let Some(current) = queue.pop_front() {
        for edge in edges.iter().filter(|e| e.from.collection == current) {
            if reached.insert(edge.to.collection.clone()) {
                queue.push_back(edge.to.collection.clone());
            }
        }
    }
    reached
}

/// Finds one cycle in an upstream map using DFS with a recursion stack.
fn find_cycle(
    upstream: &BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>>,
) -> Option<Vec<CollectionAddress>> {
    let mut visited = BTreeSet::new();
    let mut rec_stack = BTreeSet::new();
    let mut path = Vec::new();

    for node in upstream.keys() {
        if !visited.contains(node) {
            if let Some(cycle) = dfs_cycle(node, upstream, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle(
    node: &CollectionAddress,
    upstream: &BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>>,
    visited: &mut BTreeSet<CollectionAddress>,
    rec_stack: &mut BTreeSet<CollectionAddress>,
    path: &mut Vec<CollectionAddress>,
) -> Option<Vec<CollectionAddress>> {
    visited.insert(node.clone());
    rec_stack.insert(node.clone());
    path.push(node.clone());

    if let Some(deps) = upstream.get(node) {
        for dep in deps {
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, upstream, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let start = path.iter().position(|n| n == dep).unwrap_or(0);
                let mut cycle: Vec<CollectionAddress> = path[start..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

/// Kahn's algorithm with an ordered ready set, so ties break by address.
fn topological_sort(
    upstream: &BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>>,
) -> Vec<CollectionAddress> {
    let mut in_degree: BTreeMap<&CollectionAddress, usize> = upstream
        .iter()
        .map(|(addr, ups)| (addr, ups.iter().filter(|u| upstream.contains_key(*u)).count()))
        .collect();
    let mut ready: BTreeSet<&CollectionAddress> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(addr, _)| *addr)
        .collect();
    let mut order = Vec::with_capacity(upstream.len());

    while let Some(next) = ready.pop_first() {
        order.push(next.clone());
        for (addr, ups) in upstream {
            if ups.contains(next) {
                if let Some(degree) = in_degree.get_mut(addr) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(addr);
                    }
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::dataset::{FieldConfig, FieldReferenceConfig};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn seeds(pairs: &[(&str, serde_json::Value)]) -> IdentitySeeds {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    fn orders_customer() -> DatasetConfig {
        DatasetConfig::new("db", "pg")
            .with_collection(
                CollectionConfig::new("customer")
                    .with_field(FieldConfig::new("id").primary_key().with_identity("customer_id"))
                    .with_field(FieldConfig::new("email").with_categories(&["user.contact.email"])),
            )
            .with_collection(
                CollectionConfig::new("orders")
                    .with_field(FieldConfig::new("id").primary_key())
                    .with_field(
                        FieldConfig::new("customer_id")
                            .with_reference(FieldReferenceConfig::from("db", "customer.id")),
                    ),
            )
    }

    fn addr(collection: &str) -> CollectionAddress {
        CollectionAddress::new("db", collection)
    }

    #[test]
    fn test_orders_customer_traversal() {
        let traversal = Traversal::build(&[orders_customer()], &seeds(&[("customer_id", json!(42))])).unwrap();

        assert_eq!(traversal.len(), 2);
        assert_eq!(traversal.topological_order(), &[addr("customer"), addr("orders")]);

        let orders = traversal.node(&addr("orders")).unwrap();
        assert!(!orders.is_root());
        assert_eq!(orders.upstream, BTreeSet::from([addr("customer")]));
        assert_eq!(orders.incoming[0].from, addr("customer").field("id"));
        assert_eq!(orders.incoming[0].to, addr("orders").field("customer_id"));

        let customer = traversal.node(&addr("customer")).unwrap();
        assert!(customer.is_root());
        assert_eq!(customer.downstream, BTreeSet::from([addr("orders")]));
        assert_eq!(customer.connection_key, "pg");
    }

    #[test]
    fn test_to_direction_reference() {
        let dataset = DatasetConfig::new("db", "pg")
            .with_collection(
                CollectionConfig::new("customer").with_field(
                    FieldConfig::new("id")
                        .with_identity("customer_id")
                        .with_reference(FieldReferenceConfig::to("db", "orders.customer_id")),
                ),
            )
            .with_collection(CollectionConfig::new("orders").with_field(FieldConfig::new("customer_id")));

        let traversal = Traversal::build(&[dataset], &seeds(&[("customer_id", json!(1))])).unwrap();
        assert_eq!(traversal.topological_order(), &[addr("customer"), addr("orders")]);
    }

    #[test]
    fn test_unresolved_reference() {
        let dataset = DatasetConfig::new("db", "pg").with_collection(
            CollectionConfig::new("orders").with_field(
                FieldConfig::new("customer_id")
                    .with_identity("customer_id")
                    .with_reference(FieldReferenceConfig::from("other_db", "customer.id")),
            ),
        );

        let err = Traversal::build(&[dataset], &seeds(&[("customer_id", json!(1))])).unwrap_err();
        assert_eq!(err.code(), codes::UNRESOLVED_REFERENCE);
        assert!(err.message.contains("other_db:customer.id"));
    }

    #[test]
    fn test_unresolved_field_in_existing_collection() {
        let mut dataset = orders_customer();
        dataset.collections[1].fields[1].references[0].field = "customer.uuid".to_string();

        let err = Traversal::build(&[dataset], &seeds(&[("customer_id", json!(1))])).unwrap_err();
        assert_eq!(err.code(), codes::UNRESOLVED_REFERENCE);
    }

    #[test]
    fn test_unresolved_after() {
        let mut dataset = orders_customer();
        dataset.collections[1].after.push(addr("invoices"));

        let err = Traversal::build(&[dataset], &seeds(&[("customer_id", json!(1))])).unwrap_err();
        assert_eq!(err.code(), codes::UNRESOLVED_REFERENCE);
    }

    #[test]
    fn test_unreachable_and_skipped() {
        let dataset = orders_customer().with_collection(
            CollectionConfig::new("audit_log").with_field(FieldConfig::new("id")),
        );
        let err = Traversal::build(&[dataset], &seeds(&[("customer_id", json!(1))])).unwrap_err();
        assert_eq!(err.code(), codes::UNREACHABLE);
        assert_eq!(err.collections, vec!["db:audit_log".to_string()]);

        let dataset = orders_customer().with_collection(
            CollectionConfig::new("audit_log").with_field(FieldConfig::new("id")).skipped(),
        );
        let traversal = Traversal::build(&[dataset], &seeds(&[("customer_id", json!(1))])).unwrap();
        assert!(traversal.node(&addr("audit_log")).is_none());
    }

    #[test]
    fn test_no_seeds() {
        let err = Traversal::build(&[orders_customer()], &seeds(&[("email", json!("a@b.c"))])).unwrap_err();
        assert_eq!(err.code(), codes::NO_SEEDS);

        let err = Traversal::build(&[orders_customer()], &seeds(&[("customer_id", json!(null))])).unwrap_err();
        assert_eq!(err.code(), codes::NO_SEEDS);
    }

    #[test]
    fn test_duplicate_collection() {
        let dataset = orders_customer().with_collection(CollectionConfig::new("orders"));
        let err = Traversal::build(&[dataset], &seeds(&[("customer_id", json!(1))])).unwrap_err();
        assert_eq!(err.code(), codes::DUPLICATE);
    }

    #[test]
    fn test_after_cycle_is_fatal() {
        let mut dataset = orders_customer();
        dataset.collections[0].after.push(addr("orders"));

        let err = Traversal::build(&[dataset], &seeds(&[("customer_id", json!(1))])).unwrap_err();
        assert_eq!(err.code(), codes::CYCLE);
        assert_eq!(err.collections.first(), err.collections.last());
    }

    #[test]
    fn test_reachable_by_two_paths_once() {
        // customer -> orders, customer -> payments, orders -> shipments, payments -> shipments
        let dataset = orders_customer()
            .with_collection(
                CollectionConfig::new("payments").with_field(
                    FieldConfig::new("customer_id")
                        .with_reference(FieldReferenceConfig::from("db", "customer.id")),
                ),
            )
            .with_collection(
                CollectionConfig::new("shipments")
                    .with_field(
                        FieldConfig::new("order_id").with_reference(FieldReferenceConfig::from("db", "orders.id")),
                    )
                    .with_field(
                        FieldConfig::new("payment_customer")
                            .with_reference(FieldReferenceConfig::from("db", "payments.customer_id")),
                    ),
            );

        let traversal = Traversal::build(&[dataset], &seeds(&[("customer_id", json!(1))])).unwrap();
        assert_eq!(traversal.len(), 4);
        assert_eq!(
            traversal.topological_order(),
            &[addr("customer"), addr("orders"), addr("payments"), addr("shipments")]
        );
        assert_eq!(
            traversal.node(&addr("shipments")).unwrap().upstream,
            BTreeSet::from([addr("orders"), addr("payments")])
        );
    }

    #[test]
    fn test_erasure_order_waits_for_readers() {
        let traversal = Traversal::build(&[orders_customer()], &seeds(&[("customer_id", json!(42))])).unwrap();
        let erasure = traversal.erasure_order().unwrap();

        assert_eq!(erasure.upstream[&addr("customer")], BTreeSet::from([addr("orders")]));
        assert!(erasure.upstream[&addr("orders")].is_empty());
        assert_eq!(erasure.order, vec![addr("orders"), addr("customer")]);
        assert_eq!(erasure.downstream[&addr("orders")], BTreeSet::from([addr("customer")]));
    }

    #[test]
    fn test_erase_after_cycle() {
        let mut dataset = orders_customer();
        dataset.collections[1].erase_after.push(addr("customer"));

        let traversal = Traversal::build(&[dataset], &seeds(&[("customer_id", json!(42))])).unwrap();
        let err = traversal.erasure_order().unwrap_err();
        assert_eq!(err.code(), codes::CYCLE);
    }

    /// Chain `c0 -> c1 -> ... -> c{n-1}` with extra forward references.
    fn chain_dataset(n: usize, extra: &[(usize, usize)], back: Option<(usize, usize)>) -> DatasetConfig {
        let mut dataset = DatasetConfig::new("db", "pg");
        for i in 0..n {
            let mut collection = CollectionConfig::new(format!("c{i}"));
            let mut id = FieldConfig::new("id").primary_key();
            if i == 0 {
                id = id.with_identity("email");
            }
            collection = collection.with_field(id);
            if i > 0 {
                collection = collection.with_field(
                    FieldConfig::new("prev").with_reference(FieldReferenceConfig::from("db", format!("c{}.id", i - 1))),
                );
            }
            for (from, to) in extra {
                if *to == i {
                    collection = collection.with_field(
                        FieldConfig::new(format!("ref_{from}"))
                            .with_reference(FieldReferenceConfig::from("db", format!("c{from}.id"))),
                    );
                }
            }
            if let Some((low, high)) = back {
                if low == i {
                    collection = collection.with_field(
                        FieldConfig::new("back").with_reference(FieldReferenceConfig::from("db", format!("c{high}.id"))),
                    );
                }
            }
            dataset = dataset.with_collection(collection);
        }
        dataset
    }

    fn forward_edges() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (3usize..9).prop_flat_map(|n| {
            let edge = (0..n, 0..n).prop_filter("forward only", |(a, b)| a < b);
            (Just(n), proptest::collection::vec(edge, 0..12))
        })
    }

    proptest! {
        #[test]
        fn test_injected_cycle_is_rejected((n, extra) in forward_edges(), low_seed in 0usize..100, span in 1usize..8) {
            let low = low_seed % (n - 1);
            let high = (low + 1 + span % (n - 1 - low)).min(n - 1);
            let dataset = chain_dataset(n, &extra, Some((low, high)));

            let err = Traversal::build(&[dataset], &seeds(&[("email", json!("a@b.c"))])).unwrap_err();
            prop_assert_eq!(err.code(), codes::CYCLE);
        }

        #[test]
        fn test_forward_graphs_are_ordered((n, extra) in forward_edges()) {
            let dataset = chain_dataset(n, &extra, None);
            let traversal = Traversal::build(&[dataset], &seeds(&[("email", json!("a@b.c"))])).unwrap();

            prop_assert_eq!(traversal.len(), n);
            let position: BTreeMap<&CollectionAddress, usize> = traversal
                .topological_order()
                .iter()
                .enumerate()
                .map(|(i, a)| (a, i))
                .collect();
            for node in traversal.nodes() {
                for up in &node.upstream {
                    prop_assert!(position[up] < position[&node.address]);
                }
            }
            prop_assert!(traversal.erasure_order().is_ok());
        }
    }
}
