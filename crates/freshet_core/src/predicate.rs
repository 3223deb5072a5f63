use crate::file_info::{ArchivePath, FileId, NAME_ATTRIBUTE};

/// A typed attribute value. Comparing values of different types never
/// satisfies a constraint, it is a type mismatch rather than an ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttrValue {
    Str(String),
    U64(u64),
}

impl AttrValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Str(_) => "str",
            AttrValue::U64(_) => "u64",
        }
    }

    fn same_type(&self, other: &AttrValue) -> bool {
        matches!(
            (self, other),
            (AttrValue::Str(_), AttrValue::Str(_)) | (AttrValue::U64(_), AttrValue::U64(_))
        )
    }
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Str(s) => f.write_str(s),
            AttrValue::U64(v) => write!(f, "{v}"),
        }
    }
}

/// Kind of value an attribute holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKind {
    Str,
    U64,
}

/// A named, typed attribute slot. Entry values are parsed from their
/// string form according to the slot's kind, so configuration can state
/// constraints without knowing the types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Attribute {
    name: String,
    kind: AttrKind,
}

impl Attribute {
    pub fn new(name: impl Into<String>, kind: AttrKind) -> Self {
        Attribute {
            name: name.into(),
            kind,
        }
    }

    /// The built-in attribute holding a file's relative path.
    pub fn file_name() -> Self {
        Attribute::new(crate::file_info::NAME_ATTRIBUTE, AttrKind::Str)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AttrKind {
        self.kind
    }

    pub fn entry_from_str(&self, raw: &str) -> anyhow::Result<AttributeEntry> {
        let value = match self.kind {
            AttrKind::Str => AttrValue::Str(raw.to_owned()),
            AttrKind::U64 => AttrValue::U64(
                raw.parse()
                    .map_err(|e| anyhow::anyhow!("attribute {}: bad value {raw:?}: {e}", self.name))?,
            ),
        };
        Ok(AttributeEntry::new(self.name.clone(), value))
    }
}

/// One named attribute of a file. Two entries are type-equal iff their
/// names and value types agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeEntry {
    name: String,
    value: AttrValue,
}

impl AttributeEntry {
    pub fn new(name: impl Into<String>, value: AttrValue) -> Self {
        AttributeEntry {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &AttrValue {
        &self.value
    }

    /// An equality constraint pinning this attribute to its value.
    pub fn equality_constraint(&self) -> Constraint {
        Constraint::equals(self.name.clone(), self.value.clone())
    }

    /// An inequality constraint excluding this value.
    pub fn inequality_constraint(&self) -> Constraint {
        Constraint::differs(self.name.clone(), self.value.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOp {
    Eq,
    Ne,
}

/// A single test against one attribute of a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constraint {
    name: String,
    op: ConstraintOp,
    value: AttrValue,
}

impl Constraint {
    pub fn new(name: impl Into<String>, op: ConstraintOp, value: AttrValue) -> Self {
        Constraint {
            name: name.into(),
            op,
            value,
        }
    }

    pub fn equals(name: impl Into<String>, value: AttrValue) -> Self {
        Constraint::new(name, ConstraintOp::Eq, value)
    }

    pub fn differs(name: impl Into<String>, value: AttrValue) -> Self {
        Constraint::new(name, ConstraintOp::Ne, value)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> ConstraintOp {
        self.op
    }

    pub fn value(&self) -> &AttrValue {
        &self.value
    }

    /// A missing attribute or a value of a different type satisfies
    /// neither Eq nor Ne.
    pub fn satisfied_by(&self, entries: &[AttributeEntry]) -> bool {
        let Some(entry) = entries.iter().find(|e| e.name == self.name) else {
            return false;
        };
        if !entry.value.same_type(&self.value) {
            return false;
        }
        match self.op {
            ConstraintOp::Eq => entry.value == self.value,
            ConstraintOp::Ne => entry.value != self.value,
        }
    }
}

/// A conjunction of constraints. The empty conjunction matches every file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    constraints: Vec<Constraint>,
}

impl Filter {
    pub fn new(constraints: Vec<Constraint>) -> Self {
        Filter { constraints }
    }

    /// The filter matching exactly one archive path.
    pub fn for_path(path: &ArchivePath) -> Self {
        Filter::new(vec![Constraint::equals(
            NAME_ATTRIBUTE,
            AttrValue::Str(path.as_str().to_owned()),
        )])
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn satisfied_by(&self, file: &FileId) -> bool {
        let entries = file.attribute_entries();
        self.constraints.iter().all(|c| c.satisfied_by(&entries))
    }

    /// True iff this filter pins every attribute of the file to the single
    /// value the file actually carries. Such a filter can match nothing
    /// else, so it becomes removable once the file is fully replicated.
    pub fn exactly_specifies(&self, file: &FileId) -> bool {
        file.attribute_entries().iter().all(|entry| {
            self.constraints.iter().any(|c| {
                c.op == ConstraintOp::Eq && c.name == entry.name() && c.value == *entry.value()
            })
        })
    }
}

/// A disjunction of filters: what a node wants. The empty disjunction
/// wants nothing, which is how a pure source is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    filters: Vec<Filter>,
}

impl Predicate {
    pub fn new(filters: Vec<Filter>) -> Self {
        Predicate { filters }
    }

    /// Wants nothing. Satisfied by no file.
    pub fn nothing() -> Self {
        Predicate::default()
    }

    /// Wants everything: a single empty conjunction.
    pub fn everything() -> Self {
        Predicate::new(vec![Filter::default()])
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn satisfied_by(&self, file: &FileId) -> bool {
        self.filters.iter().any(|f| f.satisfied_by(file))
    }

    /// Drops the one filter that exactly specifies this file, if any.
    /// Never removes more than one filter. Returns true iff a filter was
    /// removed.
    pub fn remove_if_possible(&mut self, file: &FileId) -> bool {
        if let Some(pos) = self.filters.iter().position(|f| f.exactly_specifies(file)) {
            self.filters.remove(pos);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> FileId {
        FileId::new(ArchivePath::new(path).unwrap())
    }

    #[test]
    fn test_constraint_eq_ne() {
        let f = file("a/b.dat");
        let entries = f.attribute_entries();
        assert!(
            Constraint::equals(NAME_ATTRIBUTE, AttrValue::Str("a/b.dat".into()))
                .satisfied_by(&entries)
        );
        assert!(
            !Constraint::equals(NAME_ATTRIBUTE, AttrValue::Str("other".into()))
                .satisfied_by(&entries)
        );
        assert!(
            Constraint::differs(NAME_ATTRIBUTE, AttrValue::Str("other".into()))
                .satisfied_by(&entries)
        );
        // Unknown attribute and type mismatch both fail.
        assert!(!Constraint::equals("owner", AttrValue::Str("x".into())).satisfied_by(&entries));
        assert!(!Constraint::equals(NAME_ATTRIBUTE, AttrValue::U64(1)).satisfied_by(&entries));
    }

    #[test]
    fn test_filter_conjunction() {
        let f = file("a/b.dat");
        let both = Filter::new(vec![
            Constraint::equals(NAME_ATTRIBUTE, AttrValue::Str("a/b.dat".into())),
            Constraint::differs(NAME_ATTRIBUTE, AttrValue::Str("c".into())),
        ]);
        assert!(both.satisfied_by(&f));
        let contradictory = Filter::new(vec![
            Constraint::equals(NAME_ATTRIBUTE, AttrValue::Str("a/b.dat".into())),
            Constraint::equals(NAME_ATTRIBUTE, AttrValue::Str("c".into())),
        ]);
        assert!(!contradictory.satisfied_by(&f));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::default().satisfied_by(&file("anything")));
        assert!(Predicate::everything().satisfied_by(&file("anything")));
        assert!(!Predicate::nothing().satisfied_by(&file("anything")));
    }

    #[test]
    fn test_exactly_specifies() {
        let f = file("a/b.dat");
        assert!(Filter::for_path(f.path()).exactly_specifies(&f));
        // An Ne constraint pins nothing.
        let ne = Filter::new(vec![Constraint::differs(
            NAME_ATTRIBUTE,
            AttrValue::Str("other".into()),
        )]);
        assert!(ne.satisfied_by(&f));
        assert!(!ne.exactly_specifies(&f));
        // The empty filter matches everything but specifies nothing.
        assert!(!Filter::default().exactly_specifies(&f));
    }

    #[test]
    fn test_remove_if_possible_removes_at_most_one() {
        let a = file("a");
        let mut p = Predicate::new(vec![
            Filter::for_path(a.path()),
            Filter::for_path(a.path()),
            Filter::for_path(file("b").path()),
        ]);
        assert!(p.remove_if_possible(&a));
        assert_eq!(p.filters().len(), 2);
        assert!(p.remove_if_possible(&a));
        assert_eq!(p.filters().len(), 1);
        assert!(!p.remove_if_possible(&a));
        assert!(p.remove_if_possible(&file("b")));
        assert!(p.is_empty());
    }

    #[test]
    fn test_attribute_parses_typed_entries() {
        let name = Attribute::file_name();
        let entry = name.entry_from_str("a/b.dat").unwrap();
        assert_eq!(entry.value(), &AttrValue::Str("a/b.dat".into()));

        let generation = Attribute::new("generation", AttrKind::U64);
        let entry = generation.entry_from_str("42").unwrap();
        assert_eq!(entry.value(), &AttrValue::U64(42));
        assert!(generation.entry_from_str("not-a-number").is_err());
    }

    #[test]
    fn test_attribute_entry_constraints() {
        let entry = AttributeEntry::new("generation", AttrValue::U64(4));
        let yes = [entry.clone()];
        let no = [AttributeEntry::new("generation", AttrValue::U64(5))];
        assert!(entry.equality_constraint().satisfied_by(&yes));
        assert!(!entry.equality_constraint().satisfied_by(&no));
        assert!(!entry.inequality_constraint().satisfied_by(&yes));
        assert!(entry.inequality_constraint().satisfied_by(&no));
    }
}
