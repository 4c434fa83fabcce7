//! In-process document collection.
//!
//! Evaluates the filter, update and pipeline operators emitted by the translator against
//! documents held in memory, and records index operations. It backs tests and local tooling;
//! it is not a general query engine.

use super::{
    collection::{DocumentCollection, DocumentDatabase, DocumentStream, FindOptions, ReplaceOutcome},
    indexes::{IDENTITY_INDEX, IndexOrder, IndexSpec},
    translate::UpdateDocument,
};
use crate::error::{Error, Result};

use indexmap::IndexMap;
use mongodb::bson::{Bson, Document, oid::ObjectId};
use parking_lot::Mutex;
use regex::Regex;

use std::{cmp::Ordering, sync::Arc};

/// Index operation recorded by a [`MemoryCollection`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IndexOperation {
    /// An index was created.
    Create(String),
    /// An index was dropped.
    Drop(String),
}

#[derive(Debug, Default)]
struct State {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
    operations: Vec<IndexOperation>,
    created: bool,
}

/// Collection held in memory.
#[derive(Debug)]
pub struct MemoryCollection {
    name: String,
    state: Mutex<State>,
}

impl MemoryCollection {
    /// Empty collection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Stored documents in insertion order.
    pub fn documents(&self) -> Vec<Document> {
        self.state.lock().documents.clone()
    }

    /// Index operations issued so far.
    pub fn operations(&self) -> Vec<IndexOperation> {
        self.state.lock().operations.clone()
    }

    /// Forgets the recorded index operations.
    pub fn clear_operations(&self) {
        self.state.lock().operations.clear();
    }

    fn is_created(&self) -> bool {
        self.state.lock().created
    }
}

impl DocumentCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_one(&self, filter: Document, projection: Option<Document>) -> Result<Option<Document>> {
        let state = self.state.lock();
        for document in &state.documents {
            if matches(document, &filter)? {
                return Ok(Some(project(document, projection.as_ref())));
            }
        }
        Ok(None)
    }

    fn find(&self, filter: Document, options: FindOptions) -> Result<DocumentStream> {
        let state = self.state.lock();
        let mut found = Vec::new();
        for document in &state.documents {
            if matches(document, &filter)? {
                found.push(document.clone());
            }
        }
        drop(state);
        if let Some(sort) = &options.sort {
            found.sort_by(|left, right| compare_by(left, right, sort));
        }
        let skip = usize::try_from(options.skip).unwrap_or(usize::MAX);
        let limit = options
            .limit
            .filter(|limit| *limit > 0)
            .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));
        let projection = options.projection;
        let documents: Vec<Document> = found
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|document| project(&document, projection.as_ref()))
            .collect();
        Ok(Box::new(documents.into_iter().map(Ok)))
    }

    fn count_documents(&self, filter: Document, limit: Option<u64>) -> Result<u64> {
        let state = self.state.lock();
        let mut count = 0_u64;
        for document in &state.documents {
            if matches(document, &filter)? {
                count += 1;
            }
        }
        Ok(match limit {
            Some(limit) if limit > 0 => count.min(limit),
            _ => count,
        })
    }

    fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> Result<ReplaceOutcome> {
        let mut state = self.state.lock();
        for document in state.documents.iter_mut() {
            if matches(document, &filter)? {
                let id = document.get("_id").cloned().unwrap_or(Bson::Null);
                *document = with_id(id, replacement);
                return Ok(ReplaceOutcome {
                    matched: 1,
                    upserted_id: None,
                });
            }
        }
        if !upsert {
            return Ok(ReplaceOutcome::default());
        }
        let id = filter
            .get("_id")
            .cloned()
            .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
        state.documents.push(with_id(id.clone(), replacement));
        state.created = true;
        Ok(ReplaceOutcome {
            matched: 0,
            upserted_id: Some(id),
        })
    }

    fn find_one_and_update(
        &self,
        filter: Document,
        update: UpdateDocument,
        upsert: bool,
    ) -> Result<Option<Document>> {
        let mut state = self.state.lock();
        for document in state.documents.iter_mut() {
            if matches(document, &filter)? {
                let updated = apply_update(document.clone(), &update)?;
                *document = updated.clone();
                return Ok(Some(updated));
            }
        }
        if !upsert {
            return Ok(None);
        }
        let mut seeded = seed(&filter)?;
        if !seeded.contains_key("_id") {
            seeded = with_id(Bson::ObjectId(ObjectId::new()), seeded);
        }
        let created = apply_update(seeded, &update)?;
        state.documents.push(created.clone());
        state.created = true;
        Ok(Some(created))
    }

    fn delete_one(&self, filter: Document) -> Result<u64> {
        let mut state = self.state.lock();
        let mut position = None;
        for (index, document) in state.documents.iter().enumerate() {
            if matches(document, &filter)? {
                position = Some(index);
                break;
            }
        }
        Ok(match position {
            Some(index) => {
                state.documents.remove(index);
                1
            }
            None => 0,
        })
    }

    fn list_indexes(&self) -> Result<Vec<IndexSpec>> {
        let state = self.state.lock();
        let mut identity = IndexSpec::new(vec![("_id".to_string(), IndexOrder::Ascending)]);
        identity.name = IDENTITY_INDEX.to_string();
        let mut indexes = vec![identity];
        indexes.extend(state.indexes.iter().cloned());
        Ok(indexes)
    }

    fn create_index(&self, index: &IndexSpec) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.indexes.iter().find(|existing| existing.name == index.name) {
            if existing.is_equivalent(index) {
                return Ok(());
            }
            return Err(Error::InvalidSchema(format!(
                "index '{}' already exists with another definition",
                index.name
            )));
        }
        state.indexes.push(index.clone());
        state.operations.push(IndexOperation::Create(index.name.clone()));
        state.created = true;
        Ok(())
    }

    fn drop_index(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.indexes.retain(|index| index.name != name);
        state.operations.push(IndexOperation::Drop(name.to_string()));
        Ok(())
    }

    fn drop_collection(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.documents.clear();
        state.indexes.clear();
        state.created = false;
        Ok(())
    }
}

/// Database of [`MemoryCollection`]s.
///
/// ```rust
/// use modular_sdk::backend::document::{
///     collection::DocumentDatabase, memory::MemoryDatabase,
/// };
///
/// let database = MemoryDatabase::new();
/// let collection = database.collection("Jobs");
/// assert_eq!(collection.name(), "Jobs");
/// assert!(database.collection_names().unwrap().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    collections: Mutex<IndexMap<String, Arc<MemoryCollection>>>,
}

impl MemoryDatabase {
    /// Empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete collection handle, for inspection.
    pub fn memory_collection(&self, name: &str) -> Arc<MemoryCollection> {
        self.collections
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCollection::new(name)))
            .clone()
    }
}

impl DocumentDatabase for MemoryDatabase {
    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection> {
        self.memory_collection(name)
    }

    fn collection_names(&self) -> Result<Vec<String>> {
        Ok(self
            .collections
            .lock()
            .iter()
            .filter(|(_, collection)| collection.is_created())
            .map(|(name, _)| name.clone())
            .collect())
    }
}

fn with_id(id: Bson, document: Document) -> Document {
    let mut identified = Document::new();
    identified.insert("_id", id);
    for (key, value) in document {
        if key != "_id" {
            identified.insert(key, value);
        }
    }
    identified
}

// Filters

fn matches(document: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => all_match(document, condition, key)?.iter().all(|matched| *matched),
            "$or" => all_match(document, condition, key)?.iter().any(|matched| *matched),
            "$nor" => !all_match(document, condition, key)?.iter().any(|matched| *matched),
            operator if operator.starts_with('$') => {
                return Err(Error::not_implemented(format!("filter operator {operator}")));
            }
            path => field_matches(resolve(document, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all_match(document: &Document, filters: &Bson, operator: &str) -> Result<Vec<bool>> {
    let Bson::Array(filters) = filters else {
        return Err(Error::not_implemented(format!("{operator} without an array")));
    };
    filters
        .iter()
        .map(|filter| match filter {
            Bson::Document(filter) => matches(document, filter),
            _ => Err(Error::not_implemented(format!("{operator} with a non-document clause"))),
        })
        .collect()
}

fn is_operator_document(value: &Bson) -> bool {
    matches!(value, Bson::Document(document) if document.keys().next().is_some_and(|key| key.starts_with('$')))
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> Result<bool> {
    let Bson::Document(operators) = condition else {
        return Ok(equals_any(value, condition));
    };
    if !is_operator_document(condition) {
        return Ok(equals_any(value, condition));
    }
    for (operator, argument) in operators {
        let matched = match operator.as_str() {
            "$eq" => equals_any(value, argument),
            "$ne" => !equals_any(value, argument),
            "$gt" => any_element(value, |value| ordered(value, argument, Ordering::is_gt)),
            "$gte" => any_element(value, |value| ordered(value, argument, Ordering::is_ge)),
            "$lt" => any_element(value, |value| ordered(value, argument, Ordering::is_lt)),
            "$lte" => any_element(value, |value| ordered(value, argument, Ordering::is_le)),
            "$in" => match argument {
                Bson::Array(candidates) => candidates
                    .iter()
                    .any(|candidate| equals_any(value, candidate)),
                _ => return Err(Error::not_implemented("$in without an array")),
            },
            "$exists" => value.is_some() == matches!(argument, Bson::Boolean(true)),
            "$regex" => {
                let Bson::String(pattern) = argument else {
                    return Err(Error::not_implemented("$regex without a string pattern"));
                };
                let regex = Regex::new(pattern).map_err(|error| {
                    Error::not_implemented(format!("regular expression '{pattern}': {error}"))
                })?;
                any_element(value, |value| matches!(value, Bson::String(string) if regex.is_match(string)))
            }
            "$options" => true,
            operator => {
                return Err(Error::not_implemented(format!("filter operator {operator}")));
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_element(value: Option<&Bson>, predicate: impl Fn(&Bson) -> bool) -> bool {
    match value {
        None => false,
        Some(Bson::Array(elements)) => elements.iter().any(&predicate),
        Some(value) => predicate(value),
    }
}

fn equals_any(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(elements)) if !matches!(expected, Bson::Array(_)) => {
            elements.iter().any(|element| equals(element, expected))
        }
        Some(value) => equals(value, expected),
    }
}

fn ordered(value: &Bson, bound: &Bson, accept: fn(Ordering) -> bool) -> bool {
    rank(value) == rank(bound) && accept(compare(value, bound))
}

fn number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(number) => Some(f64::from(*number)),
        Bson::Int64(number) => Some(*number as f64),
        Bson::Double(number) => Some(*number),
        _ => None,
    }
}

fn equals(left: &Bson, right: &Bson) -> bool {
    if let (Some(left), Some(right)) = (number(left), number(right)) {
        return left == right;
    }
    match (left, right) {
        (Bson::Array(left), Bson::Array(right)) => {
            left.len() == right.len() && left.iter().zip(right).all(|(l, r)| equals(l, r))
        }
        (Bson::Document(left), Bson::Document(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .zip(right)
                    .all(|((lk, lv), (rk, rv))| lk == rk && equals(lv, rv))
        }
        (left, right) => left == right,
    }
}

fn rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        _ => 12,
    }
}

fn compare(left: &Bson, right: &Bson) -> Ordering {
    let by_rank = rank(left).cmp(&rank(right));
    if by_rank != Ordering::Equal {
        return by_rank;
    }
    if let (Some(left), Some(right)) = (number(left), number(right)) {
        return left.partial_cmp(&right).unwrap_or(Ordering::Equal);
    }
    match (left, right) {
        (Bson::String(left), Bson::String(right)) => left.cmp(right),
        (Bson::Boolean(left), Bson::Boolean(right)) => left.cmp(right),
        (Bson::DateTime(left), Bson::DateTime(right)) => left.cmp(right),
        (Bson::ObjectId(left), Bson::ObjectId(right)) => left.bytes().cmp(&right.bytes()),
        (Bson::Binary(left), Bson::Binary(right)) => left.bytes.cmp(&right.bytes),
        (Bson::Array(left), Bson::Array(right)) => left
            .iter()
            .zip(right)
            .map(|(l, r)| compare(l, r))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| left.len().cmp(&right.len())),
        (Bson::Document(left), Bson::Document(right)) => left
            .iter()
            .zip(right)
            .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| compare(lv, rv)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| left.len().cmp(&right.len())),
        _ => Ordering::Equal,
    }
}

fn compare_by(left: &Document, right: &Document, sort: &Document) -> Ordering {
    for (path, direction) in sort {
        let left = resolve(left, path).unwrap_or(&Bson::Null);
        let right = resolve(right, path).unwrap_or(&Bson::Null);
        let ordering = compare(left, right);
        let ordering = match IndexOrder::from_bson(direction.clone()) {
            IndexOrder::Descending => ordering.reverse(),
            _ => ordering,
        };
        if ordering.is_ne() {
            return ordering;
        }
    }
    Ordering::Equal
}

// Paths

fn resolve<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(document) => document.get(part)?,
            Bson::Array(array) => array.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn unsupported(path: &str, reason: &str) -> Error {
    Error::UnsupportedPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn set_path(document: &mut Document, path: &str, value: Bson) -> Result<()> {
    set_in_document(document, path, value, path)
}

fn set_in_document(document: &mut Document, path: &str, value: Bson, full: &str) -> Result<()> {
    let Some((head, rest)) = path.split_once('.') else {
        document.insert(path, value);
        return Ok(());
    };
    if !matches!(document.get(head), Some(Bson::Document(_) | Bson::Array(_))) {
        if document.get(head).is_some_and(|current| !matches!(current, Bson::Null)) {
            return Err(unsupported(full, "cannot create a field inside a scalar value"));
        }
        document.insert(head, Document::new());
    }
    match document.get_mut(head) {
        Some(child) => set_in(child, rest, value, full),
        None => Ok(()),
    }
}

fn set_in(target: &mut Bson, path: &str, value: Bson, full: &str) -> Result<()> {
    match target {
        Bson::Document(document) => set_in_document(document, path, value, full),
        Bson::Array(array) => {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path, None),
            };
            let index: usize = head
                .parse()
                .map_err(|_| unsupported(full, "list elements are addressed by position"))?;
            while array.len() <= index {
                array.push(Bson::Null);
            }
            match rest {
                None => array[index] = value,
                Some(rest) => {
                    if matches!(array[index], Bson::Null) {
                        array[index] = Bson::Document(Document::new());
                    }
                    set_in(&mut array[index], rest, value, full)?;
                }
            }
            Ok(())
        }
        _ => Err(unsupported(full, "cannot create a field inside a scalar value")),
    }
}

fn remove_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(child) = document.get_mut(head) {
                remove_in(child, rest);
            }
        }
    }
}

fn remove_in(target: &mut Bson, path: &str) {
    match target {
        Bson::Document(document) => remove_path(document, path),
        Bson::Array(array) => {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path, None),
            };
            let Ok(index) = head.parse::<usize>() else {
                return;
            };
            match (array.get_mut(index), rest) {
                (Some(element), None) => *element = Bson::Null,
                (Some(element), Some(rest)) => remove_in(element, rest),
                (None, _) => {}
            }
        }
        _ => {}
    }
}

fn project(document: &Document, projection: Option<&Document>) -> Document {
    let Some(projection) = projection else {
        return document.clone();
    };
    let mut projected = Document::new();
    if let Some(id) = document.get("_id") {
        projected.insert("_id", id.clone());
    }
    for path in projection.keys() {
        if let Some(value) = resolve(document, path) {
            // paths come from existing values, so the write cannot fail
            let _ = set_path(&mut projected, path, value.clone());
        }
    }
    projected
}

/// Fields an upsert starts from: the equality clauses of the filter.
fn seed(filter: &Document) -> Result<Document> {
    let mut seeded = Document::new();
    for (key, value) in filter {
        if key == "$and" {
            if let Bson::Array(clauses) = value {
                for clause in clauses {
                    if let Bson::Document(clause) = clause {
                        for (key, value) in seed(clause)? {
                            set_path(&mut seeded, &key, value)?;
                        }
                    }
                }
            }
        } else if !key.starts_with('$') && !is_operator_document(value) {
            set_path(&mut seeded, key, value.clone())?;
        }
    }
    Ok(seeded)
}

// Updates

fn apply_update(document: Document, update: &UpdateDocument) -> Result<Document> {
    match update {
        UpdateDocument::Document(operators) => apply_operators(document, operators),
        UpdateDocument::Pipeline(stages) => stages
            .iter()
            .try_fold(document, |document, stage| apply_stage(document, stage)),
    }
}

fn operator_arguments<'a>(operator: &str, arguments: &'a Bson) -> Result<&'a Document> {
    match arguments {
        Bson::Document(arguments) => Ok(arguments),
        _ => Err(Error::not_implemented(format!("{operator} without a document"))),
    }
}

fn apply_operators(mut document: Document, operators: &Document) -> Result<Document> {
    for (operator, arguments_bson) in operators {
        let arguments = operator_arguments(operator, arguments_bson)?;
        for (path, argument) in arguments {
            match operator.as_str() {
                "$set" => set_path(&mut document, path, argument.clone())?,
                "$unset" => remove_path(&mut document, path),
                "$inc" => {
                    let current = resolve(&document, path).cloned().unwrap_or(Bson::Int32(0));
                    let sum = add(&current, argument).ok_or_else(|| {
                        unsupported(path, "cannot increment a non-numeric value")
                    })?;
                    set_path(&mut document, path, sum)?;
                }
                "$push" => {
                    let (items, position) = match argument {
                        Bson::Document(modifiers) if modifiers.contains_key("$each") => (
                            match modifiers.get("$each") {
                                Some(Bson::Array(items)) => items.clone(),
                                _ => return Err(Error::not_implemented("$each without an array")),
                            },
                            modifiers.get("$position").and_then(number),
                        ),
                        item => (vec![item.clone()], None),
                    };
                    let mut list = current_list(&document, path)?;
                    let at = position.map_or(list.len(), |position| {
                        (position.max(0.0) as usize).min(list.len())
                    });
                    list.splice(at..at, items);
                    set_path(&mut document, path, Bson::Array(list))?;
                }
                "$addToSet" => {
                    let items = match argument {
                        Bson::Document(modifiers) if modifiers.contains_key("$each") => {
                            match modifiers.get("$each") {
                                Some(Bson::Array(items)) => items.clone(),
                                _ => return Err(Error::not_implemented("$each without an array")),
                            }
                        }
                        item => vec![item.clone()],
                    };
                    let mut list = current_list(&document, path)?;
                    for item in items {
                        if !list.iter().any(|existing| equals(existing, &item)) {
                            list.push(item);
                        }
                    }
                    set_path(&mut document, path, Bson::Array(list))?;
                }
                "$pullAll" => {
                    let Bson::Array(removed) = argument else {
                        return Err(Error::not_implemented("$pullAll without an array"));
                    };
                    if resolve(&document, path).is_some() {
                        let mut list = current_list(&document, path)?;
                        list.retain(|item| !removed.iter().any(|removed| equals(item, removed)));
                        set_path(&mut document, path, Bson::Array(list))?;
                    }
                }
                operator => {
                    return Err(Error::not_implemented(format!("update operator {operator}")));
                }
            }
        }
    }
    Ok(document)
}

fn current_list(document: &Document, path: &str) -> Result<Vec<Bson>> {
    match resolve(document, path) {
        None | Some(Bson::Null) => Ok(Vec::new()),
        Some(Bson::Array(list)) => Ok(list.clone()),
        Some(_) => Err(unsupported(path, "the stored value is not a list")),
    }
}

fn add(left: &Bson, right: &Bson) -> Option<Bson> {
    match (left, right) {
        (Bson::Int32(left), Bson::Int32(right)) => Some(
            left.checked_add(*right)
                .map_or_else(|| Bson::Int64(i64::from(*left) + i64::from(*right)), Bson::Int32),
        ),
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            let left = integer(left)?;
            let right = integer(right)?;
            Some(Bson::Int64(left.checked_add(right)?))
        }
        (left, right) => Some(Bson::Double(number(left)? + number(right)?)),
    }
}

fn integer(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(number) => Some(i64::from(*number)),
        Bson::Int64(number) => Some(*number),
        _ => None,
    }
}

fn apply_stage(mut document: Document, stage: &Document) -> Result<Document> {
    for (name, specification) in stage {
        match name.as_str() {
            "$set" | "$addFields" => {
                let assignments = operator_arguments(name, specification)?;
                let mut evaluated = Vec::with_capacity(assignments.len());
                for (path, expression) in assignments {
                    evaluated.push((path.clone(), evaluate(expression, &document)?));
                }
                for (path, value) in evaluated {
                    set_path(&mut document, &path, value)?;
                }
            }
            "$unset" => match specification {
                Bson::String(path) => remove_path(&mut document, path),
                Bson::Array(paths) => {
                    for path in paths {
                        if let Bson::String(path) = path {
                            remove_path(&mut document, path);
                        }
                    }
                }
                _ => return Err(Error::not_implemented("$unset stage with a non-path argument")),
            },
            stage => return Err(Error::not_implemented(format!("pipeline stage {stage}"))),
        }
    }
    Ok(document)
}

fn evaluate(expression: &Bson, document: &Document) -> Result<Bson> {
    match expression {
        Bson::String(reference) if reference.starts_with('$') => {
            Ok(resolve(document, &reference[1..]).cloned().unwrap_or(Bson::Null))
        }
        Bson::Array(items) => items
            .iter()
            .map(|item| evaluate(item, document))
            .collect::<Result<Vec<_>>>()
            .map(Bson::Array),
        Bson::Document(operator) if is_operator_document(expression) => {
            let Some((name, argument)) = operator.iter().next() else {
                return Ok(Bson::Document(Document::new()));
            };
            evaluate_operator(name, argument, document)
        }
        Bson::Document(object) => {
            let mut evaluated = Document::new();
            for (key, value) in object {
                evaluated.insert(key.clone(), evaluate(value, document)?);
            }
            Ok(Bson::Document(evaluated))
        }
        literal => Ok(literal.clone()),
    }
}

fn evaluate_arguments(name: &str, argument: &Bson, document: &Document) -> Result<Vec<Bson>> {
    match argument {
        Bson::Array(items) => items.iter().map(|item| evaluate(item, document)).collect(),
        _ => Err(Error::not_implemented(format!("{name} without an argument list"))),
    }
}

fn evaluate_operator(name: &str, argument: &Bson, document: &Document) -> Result<Bson> {
    let value = match name {
        "$literal" => argument.clone(),
        "$ifNull" => evaluate_arguments(name, argument, document)?
            .into_iter()
            .find(|value| !matches!(value, Bson::Null | Bson::Undefined))
            .unwrap_or(Bson::Null),
        "$add" => {
            let operands = evaluate_arguments(name, argument, document)?;
            if operands.iter().any(|operand| matches!(operand, Bson::Null)) {
                return Ok(Bson::Null);
            }
            operands
                .iter()
                .try_fold(Bson::Int32(0), |sum, operand| add(&sum, operand))
                .ok_or_else(|| Error::not_implemented("$add of non-numeric values"))?
        }
        "$subtract" => match evaluate_arguments(name, argument, document)?.as_slice() {
            [Bson::Null, _] | [_, Bson::Null] => Bson::Null,
            [left, right] => add(left, &negate(right)?)
                .ok_or_else(|| Error::not_implemented("$subtract of non-numeric values"))?,
            _ => return Err(Error::not_implemented("$subtract without two operands")),
        },
        "$concatArrays" => {
            let mut concatenated = Vec::new();
            for operand in evaluate_arguments(name, argument, document)? {
                match operand {
                    Bson::Array(items) => concatenated.extend(items),
                    Bson::Null => return Ok(Bson::Null),
                    _ => return Err(Error::not_implemented("$concatArrays of a non-list value")),
                }
            }
            Bson::Array(concatenated)
        }
        "$size" => {
            let operand = match argument {
                Bson::Array(items) if items.len() == 1 => evaluate(&items[0], document)?,
                other => evaluate(other, document)?,
            };
            match operand {
                Bson::Array(items) => Bson::Int64(i64::try_from(items.len()).unwrap_or(i64::MAX)),
                _ => return Err(Error::not_implemented("$size of a non-list value")),
            }
        }
        "$slice" => {
            let operands = evaluate_arguments(name, argument, document)?;
            let (items, position, count) = match operands.as_slice() {
                [Bson::Array(items), count] => (items, None, integer(count)),
                [Bson::Array(items), position, count] => {
                    (items, integer(position), integer(count))
                }
                [Bson::Null, ..] => return Ok(Bson::Null),
                _ => return Err(Error::not_implemented("$slice with unexpected operands")),
            };
            let count = count.ok_or_else(|| Error::not_implemented("$slice with a non-integer count"))?;
            Bson::Array(slice(items, position, count))
        }
        name => return Err(Error::not_implemented(format!("expression operator {name}"))),
    };
    Ok(value)
}

fn negate(value: &Bson) -> Result<Bson> {
    match value {
        Bson::Int32(number) => Ok(number
            .checked_neg()
            .map_or_else(|| Bson::Int64(-i64::from(*number)), Bson::Int32)),
        Bson::Int64(number) => Ok(Bson::Int64(number.saturating_neg())),
        Bson::Double(number) => Ok(Bson::Double(-number)),
        _ => Err(Error::not_implemented("$subtract of non-numeric values")),
    }
}

fn slice(items: &[Bson], position: Option<i64>, count: i64) -> Vec<Bson> {
    let length = items.len() as i64;
    let (start, count) = match position {
        None if count >= 0 => (0, count),
        None => ((length + count).max(0), -count),
        Some(position) if position >= 0 => (position.min(length), count.max(0)),
        Some(position) => ((length + position).max(0), count.max(0)),
    };
    let end = start.saturating_add(count).min(length);
    items[start as usize..end.max(start) as usize].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        backend::document::translate,
        common::{path::Path, update::ArithmeticOperator, update::Action},
    };

    use mongodb::bson::doc;
    use rstest::rstest;

    fn collection() -> MemoryCollection {
        let collection = MemoryCollection::new("T");
        for document in [
            doc! {"n": "a", "c": 1, "s": "alpha", "l": [1, 2], "m": {"x": 1}},
            doc! {"n": "b", "c": 5, "s": "beta", "l": [3]},
            doc! {"n": "c", "c": 10, "s": "gamma.1"},
        ] {
            collection.replace_one(doc! {"n": document.get_str("n").unwrap()}, document, true).unwrap();
        }
        collection
    }

    fn names(collection: &MemoryCollection, filter: Document) -> Vec<String> {
        collection
            .find(filter, FindOptions::default())
            .unwrap()
            .map(|document| document.unwrap().get_str("n").unwrap().to_string())
            .collect()
    }

    #[rstest]
    #[case::equals(doc! {"n": "a"}, vec!["a"])]
    #[case::greater(doc! {"c": {"$gt": 1}}, vec!["b", "c"])]
    #[case::between(doc! {"c": {"$gte": 1, "$lte": 5}}, vec!["a", "b"])]
    #[case::not_equals(doc! {"c": {"$ne": 5}}, vec!["a", "c"])]
    #[case::is_in(doc! {"n": {"$in": ["a", "c"]}}, vec!["a", "c"])]
    #[case::exists(doc! {"m": {"$exists": true}}, vec!["a"])]
    #[case::not_exists(doc! {"l": {"$exists": false}}, vec!["c"])]
    #[case::prefix(doc! {"s": {"$regex": "^be"}}, vec!["b"])]
    #[case::escaped(doc! {"s": {"$regex": "a\\.1"}}, vec!["c"])]
    #[case::array_element(doc! {"l": 2}, vec!["a"])]
    #[case::list_position(doc! {"l.0": 3}, vec!["b"])]
    #[case::nested(doc! {"m.x": 1}, vec!["a"])]
    #[case::or(doc! {"$or": [{"n": "a"}, {"c": 10}]}, vec!["a", "c"])]
    #[case::and(doc! {"$and": [{"c": {"$gt": 1}}, {"c": {"$lt": 10}}]}, vec!["b"])]
    #[case::nor(doc! {"$nor": [{"n": "a"}]}, vec!["b", "c"])]
    #[case::nothing(doc! {"$nor": [{}]}, Vec::<&str>::new())]
    #[case::mixed_types(doc! {"c": {"$gt": "a"}}, Vec::<&str>::new())]
    fn test_filters(#[case] filter: Document, #[case] expected: Vec<&str>) {
        assert_eq!(names(&collection(), filter), expected);
    }

    #[test]
    fn test_sort_skip_limit() {
        let collection = collection();
        let options = FindOptions {
            skip: 1,
            limit: Some(1),
            sort: Some(doc! {"c": -1}),
            ..Default::default()
        };
        let found: Vec<Document> = collection
            .find(doc! {}, options)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get_str("n").unwrap(), "b");
        assert_eq!(collection.count_documents(doc! {}, None).unwrap(), 3);
        assert_eq!(collection.count_documents(doc! {}, Some(2)).unwrap(), 2);
    }

    #[test]
    fn test_projection_keeps_identity() {
        let collection = collection();
        let document = collection
            .find_one(doc! {"n": "a"}, Some(doc! {"m.x": 1}))
            .unwrap()
            .unwrap();
        assert!(document.contains_key("_id"));
        assert_eq!(document.get_document("m").unwrap(), &doc! {"x": 1});
        assert!(!document.contains_key("c"));
    }

    #[test]
    fn test_replace_keeps_identity() {
        let collection = collection();
        let before = collection.find_one(doc! {"n": "a"}, None).unwrap().unwrap();
        let outcome = collection
            .replace_one(doc! {"n": "a"}, doc! {"n": "a", "c": 2}, true)
            .unwrap();
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.upserted_id, None);
        let after = collection.find_one(doc! {"n": "a"}, None).unwrap().unwrap();
        assert_eq!(after.get("_id"), before.get("_id"));
        assert_eq!(after.keys().collect::<Vec<_>>(), vec!["_id", "n", "c"]);
    }

    fn updated(actions: Vec<Action>) -> Document {
        let collection = collection();
        let update = translate::update(&actions).unwrap();
        let mut document = collection
            .find_one_and_update(doc! {"n": "a"}, update, false)
            .unwrap()
            .unwrap();
        document.remove("_id");
        document
    }

    #[rstest]
    #[case::set(
        vec![Path::new("s").set("x"), Path::parse("m.y").unwrap().set(2)],
        doc! {"n": "a", "c": 1, "s": "x", "l": [1, 2], "m": {"x": 1, "y": 2}}
    )]
    #[case::increment_and_append(
        vec![Path::new("c").increment(5), Path::new("l").append([3])],
        doc! {"n": "a", "c": 6, "s": "alpha", "l": [1, 2, 3], "m": {"x": 1}}
    )]
    #[case::prepend_and_decrement(
        vec![Path::new("l").prepend([0]), Path::new("c").decrement(3)],
        doc! {"n": "a", "c": -2, "s": "alpha", "l": [0, 1, 2], "m": {"x": 1}}
    )]
    #[case::remove(
        vec![Path::new("s").remove(), Path::parse("m.x").unwrap().remove()],
        doc! {"n": "a", "c": 1, "l": [1, 2], "m": {}}
    )]
    #[case::remove_list_element(
        vec![Path::parse("l[0]").unwrap().remove()],
        doc! {"n": "a", "c": 1, "s": "alpha", "l": [2], "m": {"x": 1}}
    )]
    #[case::set_if_not_exists(
        vec![Path::new("s").set_if_not_exists("x"), Path::new("new").set_if_not_exists("$y")],
        doc! {"n": "a", "c": 1, "s": "alpha", "l": [1, 2], "m": {"x": 1}, "new": "$y"}
    )]
    #[case::arithmetic(
        vec![Action::arithmetic(Path::new("total"), Path::new("c"), ArithmeticOperator::Subtract, 4)],
        doc! {"n": "a", "c": 1, "s": "alpha", "l": [1, 2], "m": {"x": 1}, "total": -3}
    )]
    #[case::mixed_pipeline(
        vec![
            Path::new("c").increment(1),
            Path::new("l").append([9]),
            Path::parse("l[0]").unwrap().remove(),
        ],
        doc! {"n": "a", "c": 2, "s": "alpha", "l": [2, 9], "m": {"x": 1}}
    )]
    fn test_updates(#[case] actions: Vec<Action>, #[case] expected: Document) {
        assert_eq!(updated(actions), expected);
    }

    #[test]
    fn test_set_operators() {
        let collection = MemoryCollection::new("T");
        collection
            .replace_one(doc! {"n": "a"}, doc! {"n": "a", "s": ["x", "y"]}, true)
            .unwrap();
        let update = UpdateDocument::Document(doc! {
            "$addToSet": {"s": {"$each": ["y", "z"]}},
        });
        collection.find_one_and_update(doc! {"n": "a"}, update, false).unwrap();
        let update = UpdateDocument::Document(doc! {"$pullAll": {"s": ["x"]}});
        let document = collection
            .find_one_and_update(doc! {"n": "a"}, update, false)
            .unwrap()
            .unwrap();
        assert_eq!(document.get_array("s").unwrap(), &vec![Bson::from("y"), Bson::from("z")]);
    }

    #[test]
    fn test_upsert_seeds_from_filter() {
        let collection = MemoryCollection::new("T");
        let update = UpdateDocument::Document(doc! {"$inc": {"c": 2}});
        let document = collection
            .find_one_and_update(doc! {"$and": [{"n": "x"}, {"d": 1}]}, update, true)
            .unwrap()
            .unwrap();
        assert!(matches!(document.get("_id"), Some(Bson::ObjectId(_))));
        assert_eq!(document.get_str("n").unwrap(), "x");
        assert_eq!(document.get_i32("d").unwrap(), 1);
        assert_eq!(document.get_i32("c").unwrap(), 2);
        let missing = collection
            .find_one_and_update(doc! {"n": "y"}, UpdateDocument::Document(doc! {}), false)
            .unwrap();
        assert!(missing.is_none());
    }

    #[rstest]
    #[case::first(None, 2, vec![1, 2])]
    #[case::last(None, -2, vec![3, 4])]
    #[case::window(Some(1), 2, vec![2, 3])]
    #[case::past_end(Some(3), 5, vec![4])]
    #[case::from_end(Some(-1), 1, vec![4])]
    fn test_slice(#[case] position: Option<i64>, #[case] count: i64, #[case] expected: Vec<i32>) {
        let items: Vec<Bson> = (1..=4).map(Bson::Int32).collect();
        let expected: Vec<Bson> = expected.into_iter().map(Bson::Int32).collect();
        assert_eq!(slice(&items, position, count), expected);
    }

    #[test]
    fn test_delete_and_drop() {
        let database = MemoryDatabase::new();
        let collection = database.memory_collection("T");
        collection.replace_one(doc! {"n": "a"}, doc! {"n": "a"}, true).unwrap();
        assert_eq!(database.collection_names().unwrap(), vec!["T"]);
        assert_eq!(collection.delete_one(doc! {"n": "b"}).unwrap(), 0);
        assert_eq!(collection.delete_one(doc! {"n": "a"}).unwrap(), 1);
        collection.drop_collection().unwrap();
        assert!(database.collection_names().unwrap().is_empty());
    }
}
