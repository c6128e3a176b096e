// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contact imports.
//!
//! Each record of a batch is matched to a contact by UUID or URNs, or a new contact is
//! created for it. Everything else on the record is applied as modifiers so it goes through
//! the same hooks as changes made by flows.

use std::collections::BTreeMap;

use tracing::{info, instrument, warn};

use super::modifiers;
use crate::assets::OrgAssets;
use crate::engine::{GroupModification, Modifier, UrnsModification};
use crate::error::Result;
use crate::models::contact::{self, Contact, ContactStatus};
use crate::models::field::FieldRef;
use crate::models::ids::{ChannelID, ContactID, ImportBatchID, UserID};
use crate::models::import::{self, BatchOutcome, ContactImport, ContactSpec, ImportBatch};
use crate::runtime::Runtime;

/// Whether a language code looks like ISO 639-3.
fn is_language_code(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_lowercase())
}

/// The modifiers that bring a contact in line with a record, and any problems with the
/// record. URNs are only appended to contacts that already existed.
fn spec_modifiers(oa: &OrgAssets, spec: &ContactSpec, existing: bool) -> (Vec<Modifier>, Vec<String>) {
    let mut mods = Vec::new();
    let mut problems = Vec::new();

    if let Some(name) = &spec.name {
        mods.push(Modifier::Name {
            name: Some(name.trim().to_string()).filter(|n| !n.is_empty()),
        });
    }

    if let Some(language) = &spec.language {
        if language.is_empty() {
            mods.push(Modifier::Language { language: None });
        } else if is_language_code(language) {
            mods.push(Modifier::Language {
                language: Some(language.clone()),
            });
        } else {
            problems.push(format!("'{}' is not a valid language code", language));
        }
    }

    if let Some(status) = spec.status {
        mods.push(Modifier::Status { status });
    }

    for (key, value) in &spec.fields {
        match oa.field_by_key(key) {
            Some(field) => mods.push(Modifier::Field {
                field: FieldRef {
                    key: field.key.clone(),
                    name: field.name.clone(),
                },
                value: Some(value.clone()).filter(|v| !v.is_empty()),
            }),
            None => problems.push(format!("'{}' is not a valid field key", key)),
        }
    }

    let mut groups = Vec::with_capacity(spec.groups.len());
    for uuid in &spec.groups {
        match oa.group_by_uuid(*uuid) {
            Some(g) if !g.is_status_group() => groups.push(g.reference()),
            _ => problems.push(format!("'{}' is not a valid group", uuid)),
        }
    }
    if !groups.is_empty() {
        mods.push(Modifier::Groups {
            groups,
            modification: GroupModification::Add,
        });
    }

    if existing && !spec.urns.is_empty() {
        mods.push(Modifier::Urns {
            urns: spec.urns.clone(),
            modification: UrnsModification::Append,
        });
    }

    (mods, problems)
}

/// Finds the contact a record is for, creating one if there isn't one. Returns whether it was
/// created, or nothing when the record names a UUID that doesn't exist.
async fn find_or_create(
    rt: &Runtime,
    oa: &OrgAssets,
    user_id: UserID,
    spec: &ContactSpec,
) -> Result<Option<(Contact, bool)>> {
    if let Some(uuid) = spec.uuid {
        let mut found = contact::load_contacts_by_uuid(&rt.db, oa.org_id(), &[uuid]).await?;
        return Ok(found.pop().map(|c| (c, false)));
    }

    if !spec.urns.is_empty() {
        let (c, created) =
            contact::get_or_create_contact(&rt.db, rt.engine.as_ref(), oa, &spec.urns, ChannelID(0)).await?;
        return Ok(Some((c, created)));
    }

    let c = contact::create_contact(
        &rt.db,
        rt.engine.as_ref(),
        oa,
        user_id,
        None,
        None,
        ContactStatus::Active,
        &[],
    )
    .await?;
    Ok(Some((c, true)))
}

async fn import_records(
    rt: &Runtime,
    oa: &OrgAssets,
    imp: &ContactImport,
    batch: &ImportBatch,
) -> Result<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    let mut by_contact: BTreeMap<ContactID, Vec<Modifier>> = BTreeMap::new();
    let mut records: BTreeMap<ContactID, (i32, &ContactSpec)> = BTreeMap::new();

    for (i, spec) in batch.specs.0.iter().enumerate() {
        let record = batch.record_start + i as i32;

        let (c, created) = match find_or_create(rt, oa, imp.created_by_id, spec).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                outcome.error(spec, record, "Unable to find contact with that UUID");
                continue;
            }
            Err(e) if e.is_validation() => {
                outcome.error(spec, record, e.to_string());
                continue;
            }
            Err(e) => return Err(e),
        };

        if created {
            outcome.num_created += 1;
        } else {
            outcome.num_updated += 1;
        }

        let (mods, problems) = spec_modifiers(oa, spec, !created);
        for p in problems {
            outcome.error(spec, record, p);
        }
        by_contact.entry(c.id).or_default().extend(mods);
        records.insert(c.id, (record, spec));
    }

    let (_, skipped) = modifiers::apply_modifiers(rt, oa, imp.created_by_id, &by_contact).await?;
    for id in skipped {
        if let Some((record, spec)) = records.get(&id) {
            outcome.error(spec, *record, "Contact was busy and couldn't be updated");
        }
    }

    Ok(outcome)
}

/// Imports one batch of a contact import, finishing the import if it was the last batch
/// outstanding.
#[instrument(skip(rt))]
pub async fn import_contact_batch(rt: &Runtime, batch_id: ImportBatchID) -> Result<BatchOutcome> {
    let batch = import::load_import_batch(&rt.db, batch_id).await?;
    let imp = import::load_import(&rt.db, batch.contact_import_id).await?;
    let oa = rt.org_assets(imp.org_id).await?;

    {
        let mut conn = rt.db.acquire().await?;
        import::mark_batch_processing(&mut conn, &batch).await?;
    }

    let result = import_records(rt, &oa, &imp, &batch).await;

    let mut conn = rt.db.acquire().await?;
    match result {
        Ok(outcome) => {
            import::mark_batch_complete(&mut conn, batch.id, &outcome).await?;
            if import::finish_import_if_done(&mut conn, imp.id).await? {
                info!(import_id = %imp.id, "Contact import complete");
            }
            Ok(outcome)
        }
        Err(e) => {
            warn!(error = %e, "Contact import batch failed");
            import::mark_batch_failed(&mut conn, batch.id).await?;
            import::finish_import_if_done(&mut conn, imp.id).await?;
            Err(e.context(format!("importing contact batch {}", batch_id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::field::{Field, FieldType};
    use crate::models::group::{Group, GroupStatus, GroupType};
    use crate::models::ids::{FieldID, GroupID};
    use uuid::Uuid;

    #[test]
    fn test_language_codes() {
        assert!(is_language_code("kin"));
        assert!(!is_language_code("en"));
        assert!(!is_language_code("ENG"));
    }

    #[test]
    fn test_spec_modifiers() {
        let group = Group {
            id: GroupID(3),
            uuid: Uuid::new_v4(),
            name: "Testers".to_string(),
            group_type: GroupType::Manual,
            status: GroupStatus::Ready,
            query: None,
            is_visible: true,
        };
        let field = Field {
            id: FieldID(2),
            uuid: Uuid::new_v4(),
            key: "age".to_string(),
            name: "Age".to_string(),
            value_type: FieldType::Number,
            is_system: false,
        };
        let oa = OrgAssets::for_tests()
            .with_groups(vec![group.clone()])
            .with_fields(vec![field]);

        let unknown_group = Uuid::new_v4();
        let spec = ContactSpec {
            name: Some(" Ann ".to_string()),
            language: Some("english".to_string()),
            urns: vec!["tel:+16055741111".to_string()],
            fields: BTreeMap::from([
                ("age".to_string(), "32".to_string()),
                ("shoe_size".to_string(), "9".to_string()),
            ]),
            groups: vec![group.uuid, unknown_group],
            import_row: 2,
            ..Default::default()
        };

        let (mods, problems) = spec_modifiers(&oa, &spec, false);
        assert_eq!(
            mods,
            vec![
                Modifier::Name {
                    name: Some("Ann".to_string())
                },
                Modifier::Field {
                    field: FieldRef {
                        key: "age".to_string(),
                        name: "Age".to_string()
                    },
                    value: Some("32".to_string()),
                },
                Modifier::Groups {
                    groups: vec![group.reference()],
                    modification: GroupModification::Add,
                },
            ]
        );
        assert_eq!(
            problems,
            vec![
                "'english' is not a valid language code".to_string(),
                "'shoe_size' is not a valid field key".to_string(),
                format!("'{}' is not a valid group", unknown_group),
            ]
        );

        // existing contacts get their URNs appended
        let (mods, _) = spec_modifiers(&oa, &spec, true);
        assert_eq!(
            mods.last(),
            Some(&Modifier::Urns {
                urns: vec!["tel:+16055741111".to_string()],
                modification: UrnsModification::Append,
            })
        );
    }
}
