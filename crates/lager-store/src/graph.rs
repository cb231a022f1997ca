//! Relationship bookkeeping over the identity map.
//!
//! Relationships hold [`Lid`]s only. Declared inverses are kept in sync
//! synchronously, one level deep: writing an inverse never triggers another
//! inverse write, except that a belongs-to that is re-pointed releases the
//! previous owner's side.

use std::collections::{BTreeMap, BTreeSet};

use lager_core::{
    ContractError, Lid, Linkage, ModelName, RelationshipDef, RelationshipKind, RelationshipValue, Schema,
    SchemaError,
};

use crate::identity_map::IdentityMap;

/// Apply server linkage to `lid.name`, materializing empty handles for
/// unknown members.
pub fn apply_linkage(
    map: &mut IdentityMap,
    schema: &Schema,
    lid: Lid,
    name: &str,
    linkage: &Linkage,
) -> Result<(), ContractError> {
    let Some(model) = map.get(lid).map(|r| r.model().clone()) else {
        return Ok(());
    };
    let def = match schema.relationship(&model, name) {
        Ok(def) => def.clone(),
        Err(e) => {
            tracing::warn!("Ignoring relationship data: {}", e);
            return Ok(());
        }
    };

    match (def.kind, linkage) {
        (RelationshipKind::BelongsTo, Linkage::One(target)) => {
            let target = match target {
                Some(identifier) => Some(map.get_or_create(&identifier.key()?)),
                None => None,
            };
            set_belongs_to(map, schema, lid, &def, target);
            Ok(())
        }
        (RelationshipKind::HasMany, Linkage::Many(targets)) => {
            let mut lids = Vec::with_capacity(targets.len());
            for identifier in targets {
                let member = map.get_or_create(&identifier.key()?);
                if !lids.contains(&member) {
                    lids.push(member);
                }
            }
            replace_has_many(map, schema, lid, &def, lids);
            Ok(())
        }
        (kind, _) => Err(ContractError::Malformed(format!(
            "relationship '{}' on '{}' is a {} but the payload did not match",
            name,
            model,
            kind.name()
        ))),
    }
}

/// Look up a relationship and check its kind.
pub fn definition(
    schema: &Schema,
    model: &ModelName,
    name: &str,
    expected: RelationshipKind,
) -> Result<RelationshipDef, SchemaError> {
    let def = schema.relationship(model, name)?;
    if def.kind != expected {
        return Err(SchemaError::WrongKind {
            model: model.to_string(),
            name: name.to_string(),
            expected: expected.name(),
            actual: def.kind.name(),
        });
    }
    Ok(def.clone())
}

pub fn set_belongs_to(
    map: &mut IdentityMap,
    schema: &Schema,
    lid: Lid,
    def: &RelationshipDef,
    target: Option<Lid>,
) {
    let Some(record) = map.get_mut(lid) else {
        return;
    };
    let previous = match record.relationship(&def.name) {
        Some(RelationshipValue::One(previous)) => *previous,
        _ => None,
    };
    record.set_relationship(&def.name, RelationshipValue::One(target));
    if previous == target {
        return;
    }

    let Some(inverse) = inverse_def(schema, def) else {
        return;
    };
    if let Some(previous) = previous {
        unlink(map, previous, &inverse, lid);
    }
    if let Some(target) = target {
        link(map, schema, target, &inverse, lid);
    }
}

pub fn replace_has_many(
    map: &mut IdentityMap,
    schema: &Schema,
    lid: Lid,
    def: &RelationshipDef,
    targets: Vec<Lid>,
) {
    let Some(record) = map.get_mut(lid) else {
        return;
    };
    let previous = record
        .relationship(&def.name)
        .map(|r| r.members())
        .unwrap_or_default();
    record.set_relationship(&def.name, RelationshipValue::Many(targets.clone()));

    let Some(inverse) = inverse_def(schema, def) else {
        return;
    };
    for removed in previous.iter().filter(|l| !targets.contains(l)) {
        unlink(map, *removed, &inverse, lid);
    }
    for added in targets.iter().filter(|l| !previous.contains(l)) {
        link(map, schema, *added, &inverse, lid);
    }
}

pub fn add_to_has_many(
    map: &mut IdentityMap,
    schema: &Schema,
    lid: Lid,
    def: &RelationshipDef,
    target: Lid,
) {
    let mut members = map
        .get(lid)
        .and_then(|r| r.relationship(&def.name))
        .map(|r| r.members())
        .unwrap_or_default();
    if !members.contains(&target) {
        members.push(target);
    }
    replace_has_many(map, schema, lid, def, members);
}

pub fn remove_from_has_many(
    map: &mut IdentityMap,
    schema: &Schema,
    lid: Lid,
    def: &RelationshipDef,
    target: Lid,
) {
    let members = map
        .get(lid)
        .and_then(|r| r.relationship(&def.name))
        .map(|r| r.members())
        .unwrap_or_default();
    let members = members.into_iter().filter(|l| *l != target).collect();
    replace_has_many(map, schema, lid, def, members);
}

fn inverse_def(schema: &Schema, def: &RelationshipDef) -> Option<RelationshipDef> {
    let name = def.inverse.as_deref()?;
    schema.relationship(&def.related, name).ok().cloned()
}

/// Record `owner` on `target`'s side of the pair.
fn link(map: &mut IdentityMap, schema: &Schema, target: Lid, inverse: &RelationshipDef, owner: Lid) {
    let Some(record) = map.get_mut(target) else {
        return;
    };
    match inverse.kind {
        RelationshipKind::BelongsTo => {
            let previous = match record.relationship(&inverse.name) {
                Some(RelationshipValue::One(previous)) => *previous,
                _ => None,
            };
            record.set_relationship(&inverse.name, RelationshipValue::One(Some(owner)));
            // The target moved away from its previous owner.
            if let (Some(previous), Some(forward)) = (previous, inverse.inverse.as_deref()) {
                if previous != owner {
                    if let Ok(forward) = schema.relationship(&inverse.related, forward) {
                        unlink(map, previous, forward, target);
                    }
                }
            }
        }
        RelationshipKind::HasMany => {
            let mut members = record
                .relationship(&inverse.name)
                .map(|r| r.members())
                .unwrap_or_default();
            if !members.contains(&owner) {
                members.push(owner);
            }
            record.set_relationship(&inverse.name, RelationshipValue::Many(members));
        }
    }
}

/// Drop `owner` from `target`'s side of the pair.
fn unlink(map: &mut IdentityMap, target: Lid, inverse: &RelationshipDef, owner: Lid) {
    if let Some(value) = map
        .get_mut(target)
        .and_then(|r| r.relationship_mut(&inverse.name))
    {
        value.remove(owner);
    }
}

/// Drop every reference to `lid` held by other records.
///
/// Returns the number of links removed.
pub fn detach(map: &mut IdentityMap, lid: Lid) -> usize {
    map.records_mut()
        .filter(|r| r.lid() != lid)
        .map(|r| r.remove_references_to(lid).len())
        .sum()
}

/// Teardown order: a record comes before every record it points at through
/// a belongs-to. Cycles are broken by lowest handle id.
pub fn teardown_order(map: &IdentityMap, schema: &Schema) -> Vec<Lid> {
    let mut dependents: BTreeMap<Lid, usize> = map.lids().into_iter().map(|l| (l, 0)).collect();
    let mut targets: BTreeMap<Lid, BTreeSet<Lid>> = BTreeMap::new();

    for record in map.records() {
        for def in schema.relationships_of(record.model()) {
            if def.kind != RelationshipKind::BelongsTo {
                continue;
            }
            if let Some(RelationshipValue::One(Some(target))) = record.relationship(&def.name) {
                if *target != record.lid()
                    && map.contains(*target)
                    && targets.entry(record.lid()).or_default().insert(*target)
                {
                    *dependents.entry(*target).or_default() += 1;
                }
            }
        }
    }

    let mut order = Vec::with_capacity(dependents.len());
    while !dependents.is_empty() {
        let next = dependents
            .iter()
            .find(|(_, count)| **count == 0)
            .or_else(|| dependents.iter().next())
            .map(|(lid, _)| *lid);
        let Some(next) = next else {
            break;
        };
        dependents.remove(&next);
        for target in targets.remove(&next).unwrap_or_default() {
            if let Some(count) = dependents.get_mut(&target) {
                *count = count.saturating_sub(1);
            }
        }
        order.push(next);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use lager_core::{ModelDef, RecordKey, ResourceIdentifier};

    fn schema() -> Schema {
        Schema::new()
            .with_model(
                ModelDef::new("person")
                    .relationship(RelationshipDef::has_many("cars", "car").inverse("person")),
            )
            .with_model(
                ModelDef::new("car")
                    .relationship(RelationshipDef::belongs_to("person", "person").inverse("cars")),
            )
    }

    fn handle(map: &mut IdentityMap, model: &str, id: &str) -> Lid {
        map.get_or_create(&RecordKey::parse(model, id).unwrap())
    }

    fn members(map: &IdentityMap, lid: Lid, name: &str) -> Vec<Lid> {
        map.get(lid)
            .and_then(|r| r.relationship(name))
            .map(|r| r.members())
            .unwrap_or_default()
    }

    #[test]
    fn test_belongs_to_updates_inverse() {
        let schema = schema();
        let mut map = IdentityMap::new();
        let car = handle(&mut map, "car", "1");

        apply_linkage(
            &mut map,
            &schema,
            car,
            "person",
            &Linkage::One(Some(ResourceIdentifier::new("person", "1"))),
        )
        .unwrap();

        let person = map.lookup(&RecordKey::parse("person", "1").unwrap()).unwrap();
        assert_eq!(members(&map, person, "cars"), vec![car]);
    }

    #[test]
    fn test_moving_a_car_releases_previous_owner() {
        let schema = schema();
        let mut map = IdentityMap::new();
        let car = handle(&mut map, "car", "1");
        let alice = handle(&mut map, "person", "a");
        let bob = handle(&mut map, "person", "b");
        let cars = schema.relationship(&"person".into(), "cars").unwrap().clone();

        add_to_has_many(&mut map, &schema, alice, &cars, car);
        assert_eq!(members(&map, car, "person"), vec![alice]);

        add_to_has_many(&mut map, &schema, bob, &cars, car);
        assert_eq!(members(&map, car, "person"), vec![bob]);
        assert!(members(&map, alice, "cars").is_empty());
        assert_eq!(members(&map, bob, "cars"), vec![car]);
    }

    #[test]
    fn test_remove_from_has_many_clears_belongs_to() {
        let schema = schema();
        let mut map = IdentityMap::new();
        let car = handle(&mut map, "car", "1");
        let person = handle(&mut map, "person", "1");
        let cars = schema.relationship(&"person".into(), "cars").unwrap().clone();

        add_to_has_many(&mut map, &schema, person, &cars, car);
        remove_from_has_many(&mut map, &schema, person, &cars, car);
        assert_eq!(
            map.get(car).unwrap().relationship("person"),
            Some(&RelationshipValue::One(None))
        );
    }

    #[test]
    fn test_mismatched_linkage_is_rejected() {
        let schema = schema();
        let mut map = IdentityMap::new();
        let car = handle(&mut map, "car", "1");
        let err = apply_linkage(&mut map, &schema, car, "person", &Linkage::Many(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, ContractError::Malformed(_)));
    }

    #[test]
    fn test_detach_drops_stale_references() {
        let schema = schema();
        let mut map = IdentityMap::new();
        let car = handle(&mut map, "car", "1");
        let person = handle(&mut map, "person", "1");
        let cars = schema.relationship(&"person".into(), "cars").unwrap().clone();
        add_to_has_many(&mut map, &schema, person, &cars, car);

        assert_eq!(detach(&mut map, person), 1);
        assert_eq!(
            map.get(car).unwrap().relationship("person"),
            Some(&RelationshipValue::One(None))
        );
    }

    #[test]
    fn test_teardown_order_puts_dependents_first() {
        let schema = schema();
        let mut map = IdentityMap::new();
        let person = handle(&mut map, "person", "1");
        let first = handle(&mut map, "car", "1");
        let second = handle(&mut map, "car", "2");
        let lonely = handle(&mut map, "person", "2");
        let cars = schema.relationship(&"person".into(), "cars").unwrap().clone();
        add_to_has_many(&mut map, &schema, person, &cars, first);
        add_to_has_many(&mut map, &schema, person, &cars, second);

        let order = teardown_order(&map, &schema);
        assert_eq!(order, vec![first, second, person, lonely]);
    }
}
