use serde::{Deserialize, Serialize};

/// Identifier of an actor (the entity earning the scored quantity).
pub type ActorId = u64;

/// Identifier of a site, for deployments that host several of them.
pub type SiteId = u64;

/// An instant in time, as whole seconds since the Unix epoch.
pub type Timestamp = i64;

/// Inclusive bounds of one time tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBounds {
    pub start: Timestamp,
    pub end: Timestamp,
}

/// A time-tiling scheme.
///
/// Implementors must tile the entire timeline exhaustively and without
/// overlap: for every instant `t`, `block_info(t)` returns the one tile
/// with `start <= t <= end`. The result may depend only on the instant
/// argument, never on the wall clock.
pub trait BlockType: Send + Sync {
    /// The stable slug this scheme is registered and persisted under.
    fn slug(&self) -> &str;

    /// The bounds of the tile containing `instant`.
    fn block_info(&self, instant: Timestamp) -> BlockBounds;
}

/// One actor's summed total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorTotal {
    pub actor: ActorId,
    pub total: i64,
}

/// Whether a query (and its cache entries) concern only the local site
/// or span the whole network of sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Site,
    Network,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Site => "site",
            Scope::Network => "network",
        }
    }
}

/// A filterable dimension of the ledger.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Actor,
    Category,
    Kind,
    Site,
}

/// Filter operator for a dimension predicate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Ne,
    In,
    NotIn,
}

/// A dimension value: numeric id or text, depending on the field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Id(u64),
    Text(String),
}

/// The right-hand side of a predicate: a scalar for `Eq`/`Ne`, a list
/// for `In`/`NotIn`. Canonicalization enforces the pairing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredicateValue {
    One(Value),
    Many(Vec<Value>),
}

/// One dimension restriction of a query.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Predicate {
    pub field: Field,
    pub op: Op,
    pub value: PredicateValue,
}

impl Predicate {
    pub fn eq(field: Field, value: Value) -> Self {
        Predicate {
            field,
            op: Op::Eq,
            value: PredicateValue::One(value),
        }
    }

    pub fn ne(field: Field, value: Value) -> Self {
        Predicate {
            field,
            op: Op::Ne,
            value: PredicateValue::One(value),
        }
    }

    pub fn is_in(field: Field, values: Vec<Value>) -> Self {
        Predicate {
            field,
            op: Op::In,
            value: PredicateValue::Many(values),
        }
    }

    pub fn not_in(field: Field, values: Vec<Value>) -> Self {
        Predicate {
            field,
            op: Op::NotIn,
            value: PredicateValue::Many(values),
        }
    }

    /// Whether `candidate` satisfies this restriction.
    ///
    /// A malformed pairing (list with `Eq`, scalar with `In`) restricts
    /// nothing; canonicalization removes such predicates before they are
    /// evaluated anywhere.
    pub fn accepts(&self, candidate: &Value) -> bool {
        match (&self.op, &self.value) {
            (Op::Eq, PredicateValue::One(v)) => candidate == v,
            (Op::Ne, PredicateValue::One(v)) => candidate != v,
            (Op::In, PredicateValue::Many(vs)) => vs.contains(candidate),
            (Op::NotIn, PredicateValue::Many(vs)) => !vs.contains(candidate),
            _ => true,
        }
    }
}

/// Comparison operator for conditions on the computed total.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A threshold on the per-actor total, applied after aggregation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TotalCondition {
    pub op: CompareOp,
    pub value: i64,
}

impl TotalCondition {
    pub fn matches(&self, total: i64) -> bool {
        match self.op {
            CompareOp::Eq => total == self.value,
            CompareOp::Ne => total != self.value,
            CompareOp::Gt => total > self.value,
            CompareOp::Ge => total >= self.value,
            CompareOp::Lt => total < self.value,
            CompareOp::Le => total <= self.value,
        }
    }
}

/// Result ordering by total. Ties always break by ascending actor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Desc,
    Asc,
}

/// The full argument set of a top-actors query, minus the time bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueryArgs {
    pub predicates: Vec<Predicate>,
    pub totals: Vec<TotalCondition>,
    pub order: Order,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl QueryArgs {
    /// Returns the canonical form of these args.
    ///
    /// Two argument sets with the same filter semantics canonicalize to
    /// the same value regardless of declaration order or encoding:
    /// list values are deduplicated and sorted, empty lists are dropped,
    /// singleton `In`/`NotIn` collapse to `Eq`/`Ne`, list predicates on
    /// a field that also carries an `Eq` are dropped, and predicates are
    /// sorted by (field, op, value).
    pub fn canonicalized(&self) -> QueryArgs {
        let mut totals = self.totals.clone();
        totals.sort();
        totals.dedup();

        QueryArgs {
            predicates: clean_predicates(&self.predicates),
            totals,
            order: self.order,
            limit: self.limit,
            offset: self.offset,
        }
    }

    /// The predicates that identify a block signature: everything except
    /// Actor restrictions, which are applied when summing over aggregate
    /// rows rather than baked into the tiles.
    pub fn block_predicates(&self) -> Vec<Predicate> {
        clean_predicates(&self.predicates)
            .into_iter()
            .filter(|p| p.field != Field::Actor)
            .collect()
    }

    /// Whether `actor` passes every Actor restriction in these args.
    pub fn actor_passes(&self, actor: ActorId) -> bool {
        let value = Value::Id(actor);
        self.predicates
            .iter()
            .filter(|p| p.field == Field::Actor)
            .all(|p| p.accepts(&value))
    }

    /// Whether `total` passes every total condition in these args.
    pub fn total_passes(&self, total: i64) -> bool {
        self.totals.iter().all(|c| c.matches(total))
    }
}

fn clean_predicates(predicates: &[Predicate]) -> Vec<Predicate> {
    let has_eq = |field: Field| {
        predicates
            .iter()
            .any(|p| p.field == field && p.op == Op::Eq && matches!(p.value, PredicateValue::One(_)))
    };

    let mut cleaned = Vec::with_capacity(predicates.len());

    for predicate in predicates {
        match (&predicate.op, &predicate.value) {
            (Op::Eq | Op::Ne, PredicateValue::One(_)) => cleaned.push(predicate.clone()),
            (Op::In | Op::NotIn, PredicateValue::Many(values)) => {
                // A list restriction is redundant next to a direct value.
                if has_eq(predicate.field) {
                    continue;
                }

                let mut values = values.clone();
                values.sort();
                values.dedup();

                match values.len() {
                    0 => continue,
                    1 => {
                        let value = values.remove(0);
                        let op = if predicate.op == Op::In { Op::Eq } else { Op::Ne };
                        cleaned.push(Predicate {
                            field: predicate.field,
                            op,
                            value: PredicateValue::One(value),
                        });
                    }
                    _ => cleaned.push(Predicate {
                        field: predicate.field,
                        op: predicate.op,
                        value: PredicateValue::Many(values),
                    }),
                }
            }
            // Mismatched operator/value pairings restrict nothing.
            _ => continue,
        }
    }

    cleaned.sort();
    cleaned.dedup();
    cleaned
}

/// Sorts totals by the requested order, breaking ties by actor id so
/// results are deterministic across query paths.
pub fn sort_totals(rows: &mut [ActorTotal], order: Order) {
    rows.sort_by(|a, b| match order {
        Order::Desc => b.total.cmp(&a.total).then_with(|| a.actor.cmp(&b.actor)),
        Order::Asc => a.total.cmp(&b.total).then_with(|| a.actor.cmp(&b.actor)),
    });
}

/// An inclusive time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub after: Timestamp,
    pub before: Timestamp,
}

impl TimeRange {
    pub fn contains(&self, instant: Timestamp) -> bool {
        self.after <= instant && instant <= self.before
    }
}

/// One transaction in the append-only ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub actor: ActorId,
    pub amount: i64,
    pub category: String,
    pub kind: String,
    pub site: SiteId,
    pub timestamp: Timestamp,
}

impl LedgerEntry {
    /// The value this entry carries for a filterable dimension.
    pub fn value_for(&self, field: Field) -> Value {
        match field {
            Field::Actor => Value::Id(self.actor),
            Field::Category => Value::Text(self.category.clone()),
            Field::Kind => Value::Text(self.kind.clone()),
            Field::Site => Value::Id(self.site),
        }
    }
}

/// A grouped-sum request against the raw ledger.
///
/// A row participates if it satisfies every predicate and falls in at
/// least one of `ranges` (an empty list means all of time). Totals are
/// grouped by actor; `totals`, `order`, `limit` and `offset` are applied
/// to the grouped result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalsQuery {
    pub predicates: Vec<Predicate>,
    pub ranges: Vec<TimeRange>,
    pub totals: Vec<TotalCondition>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl TotalsQuery {
    pub fn new(predicates: Vec<Predicate>, ranges: Vec<TimeRange>) -> Self {
        TotalsQuery {
            predicates,
            ranges,
            totals: Vec::new(),
            order: None,
            limit: None,
            offset: 0,
        }
    }
}

/// Executes filtered, grouped, ordered scans over the transaction log.
///
/// The aggregation engine consumes this as an external collaborator: it
/// always supplies its own time ranges and relies on grouped per-actor
/// sums coming back.
pub trait LedgerQuery {
    type Error;

    fn totals(&self, query: &TotalsQuery) -> Result<Vec<ActorTotal>, Self::Error>;
}
