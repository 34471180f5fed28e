//! Built-in stages, one per category of the game-data catalog.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use dex_core::PreDocument;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::campaign::{GachaStage, RogueStage, SandboxStage, StageTableStage};
use crate::{ArtifactRef, ArtifactSet, Extraction, LookupRegistry, RegistryUpdate, Stage, StageError};

const ACTIVITY_TABLE: &str = "excel/activity_table.json";
const BATTLE_EQUIP_TABLE: &str = "excel/battle_equip_table.json";
const BUILDING_DATA: &str = "excel/building_data.json";
const CHARACTER_TABLE: &str = "excel/character_table.json";
const CHAR_PATCH_TABLE: &str = "excel/char_patch_table.json";
const ENEMY_DATABASE: &str = "levels/enemydata/enemy_database.json";
const ENEMY_HANDBOOK_TABLE: &str = "excel/enemy_handbook_table.json";
pub(crate) const GACHA_TABLE: &str = "excel/gacha_table.json";
const GAMEDATA_CONST: &str = "excel/gamedata_const.json";
const HANDBOOK_INFO_TABLE: &str = "excel/handbook_info_table.json";
const ITEM_TABLE: &str = "excel/item_table.json";
const RANGE_TABLE: &str = "excel/range_table.json";
const SKILL_TABLE: &str = "excel/skill_table.json";
const SKIN_TABLE: &str = "excel/skin_table.json";
const UNIEQUIP_TABLE: &str = "excel/uniequip_table.json";

// Summons and traps share the character table with playable operators.
const DEPLOYABLE_ARCHETYPES: [&str; 2] = ["notchar1", "notchar2"];

/// Every built-in stage, in declaration order.
pub fn catalog() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(ArchetypeStage),
        Box::new(BaseStage),
        Box::new(ModuleStage),
        Box::new(ParadoxStage),
        Box::new(RangeStage),
        Box::new(SkillStage),
        Box::new(SkinStage),
        Box::new(DeployableStage),
        Box::new(OperatorStage),
        Box::new(RecruitStage),
        Box::new(CrossLocaleOperatorStage),
        Box::new(DefinitionStage),
        Box::new(EnemyStage),
        Box::new(EventStage),
        Box::new(GachaStage),
        Box::new(ItemStage),
        Box::new(RogueStage),
        Box::new(SandboxStage),
        Box::new(StageTableStage::NORMAL),
        Box::new(StageTableStage::TOUGH),
    ]
}

pub fn stage_for(category: &str) -> Option<Box<dyn Stage>> {
    catalog().into_iter().find(|s| s.category() == category)
}

pub(crate) fn member<'a>(value: &'a Value, artifact: &str, field: &str) -> Result<&'a Value, StageError> {
    value
        .get(field)
        .ok_or_else(|| StageError::shape(artifact, format!("missing field `{field}`")))
}

pub(crate) fn entries<'a>(value: &'a Value, artifact: &str) -> Result<&'a Map<String, Value>, StageError> {
    value
        .as_object()
        .ok_or_else(|| StageError::shape(artifact, "expected an object table"))
}

pub(crate) fn text<'a>(record: &'a Value, artifact: &str, field: &str) -> Result<&'a str, StageError> {
    member(record, artifact, field)?
        .as_str()
        .ok_or_else(|| StageError::shape(artifact, format!("field `{field}` is not a string")))
}

pub(crate) fn opt_text<'a>(record: &'a Value, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

pub(crate) fn array<'a>(record: &'a Value, field: &str) -> &'a [Value] {
    record
        .get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

// Community shorthand that no spelling rule derives from the display name.
const OPERATOR_ALIASES: &[(&str, &[&str])] = &[
    ("char_4055_bgsnow", &["pozemka"]),
    ("char_4064_mlynar", &["mlynar"]),
    ("char_002_amiya", &["caster amiya", "amiya caster"]),
    ("char_1001_amiya2", &["guard amiya", "amiya guard"]),
    ("char_1037_amiya3", &["medic amiya", "amiya medic"]),
    ("char_1012_skadi2", &["skalter"]),
    ("char_1013_chen2", &["chalter"]),
    ("char_1014_nearl2", &["ntr"]),
    ("char_1023_ghost2", &["spalter"]),
    ("char_1026_gval2", &["gavialter"]),
    ("char_1028_texas2", &["texalter"]),
    ("char_1020_reed2", &["reedalter"]),
    ("char_1029_yato2", &["yalter"]),
    ("char_1016_agoat2", &["eyjafyalla the hvit aska", "eyjalter"]),
    ("char_1033_swire2", &["swalter"]),
    ("char_1034_jesca2", &["jessicalter"]),
    ("char_1035_wisdel", &["wisadel", "w alter", "walter"]),
    ("char_1019_siege2", &["salter"]),
];

// Duplicate table entry for an operator that is listed twice.
const SKIPPED_OPERATORS: [&str; 1] = ["char_512_aprot"];

/// Display name plus the spellings people actually type.
fn name_keys(id: &str, name: &str) -> Vec<String> {
    let lower = name.to_lowercase();
    let mut keys = vec![
        id.to_string(),
        lower.clone(),
        lower.replace(['\'', '-'], ""),
        lower.replace(['\'', '-'], " "),
    ];
    let alters = keys[1..]
        .iter()
        .filter_map(|k| k.split_once(" the ").map(|(head, _)| format!("{head} alter")))
        .collect::<Vec<_>>();
    keys.extend(alters);
    if let Some((_, aliases)) = OPERATOR_ALIASES.iter().find(|(op, _)| *op == id) {
        keys.extend(aliases.iter().map(|a| a.to_string()));
    }
    keys
}

fn is_deployable(data: &Value) -> bool {
    opt_text(data, "subProfessionId").is_some_and(|s| DEPLOYABLE_ARCHETYPES.contains(&s))
}

fn is_operator(id: &str, data: &Value) -> bool {
    id.starts_with("char_") && !SKIPPED_OPERATORS.contains(&id) && !is_deployable(data)
}

/// Secondary-locale tables that cross-locale operators join against when the
/// primary registry has no entry.
struct SecondaryTables<'a> {
    archetypes: &'a Map<String, Value>,
    bases: &'a Map<String, Value>,
    modules: &'a Map<String, Value>,
    battle_equip: &'a Value,
    paradoxes: BTreeMap<&'a str, Value>,
    ranges: &'a Map<String, Value>,
    skills: &'a Map<String, Value>,
    skins: BTreeMap<&'a str, Vec<Value>>,
}

impl<'a> SecondaryTables<'a> {
    fn from_artifacts(artifacts: &'a ArtifactSet) -> Result<Self, StageError> {
        let uniequip = artifacts.secondary(UNIEQUIP_TABLE)?;
        let building = artifacts.secondary(BUILDING_DATA)?;
        let skin_table = artifacts.secondary(SKIN_TABLE)?;

        let mut skins: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        for skin in entries(member(skin_table, SKIN_TABLE, "charSkins")?, SKIN_TABLE)?.values() {
            if let Some(char_id) = opt_text(skin, "charId") {
                skins.entry(char_id).or_default().push(skin.clone());
            }
        }

        // Only the levels the primary locale lacks were fetched.
        let mut paradoxes = BTreeMap::new();
        for excel in secondary_handbook(artifacts)?.values() {
            let level = ArtifactRef::secondary(ParadoxStage::level_path(excel)?);
            if let (Some(char_id), Ok(levels)) = (opt_text(excel, "charId"), artifacts.get(&level)) {
                paradoxes.insert(char_id, json!({ "excel": excel, "levels": levels }));
            }
        }

        Ok(Self {
            archetypes: entries(member(uniequip, UNIEQUIP_TABLE, "subProfDict")?, UNIEQUIP_TABLE)?,
            bases: entries(member(building, BUILDING_DATA, "buffs")?, BUILDING_DATA)?,
            modules: entries(member(uniequip, UNIEQUIP_TABLE, "equipDict")?, UNIEQUIP_TABLE)?,
            battle_equip: artifacts.secondary(BATTLE_EQUIP_TABLE)?,
            paradoxes,
            ranges: entries(artifacts.secondary(RANGE_TABLE)?, RANGE_TABLE)?,
            skills: entries(artifacts.secondary(SKILL_TABLE)?, SKILL_TABLE)?,
            skins,
        })
    }
}

fn secondary_handbook(artifacts: &ArtifactSet) -> Result<&Map<String, Value>, StageError> {
    let handbook = artifacts.secondary(HANDBOOK_INFO_TABLE)?;
    entries(
        member(handbook, HANDBOOK_INFO_TABLE, "handbookStageData")?,
        HANDBOOK_INFO_TABLE,
    )
}

/// Join targets for operator-like records: the run's registry, then the
/// secondary locale's tables when present. A miss is `null`.
struct Joins<'a> {
    registry: &'a LookupRegistry,
    secondary: Option<SecondaryTables<'a>>,
}

impl<'a> Joins<'a> {
    fn primary(registry: &'a LookupRegistry) -> Self {
        Self {
            registry,
            secondary: None,
        }
    }

    fn lookup<F>(&self, category: &str, id: &str, fallback: F) -> Value
    where
        F: FnOnce(&SecondaryTables<'a>) -> Option<Value>,
    {
        if let Some(found) = self.registry.get(category, id) {
            return found.clone();
        }
        self.secondary.as_ref().and_then(fallback).unwrap_or(Value::Null)
    }

    fn archetype(&self, id: &str) -> Value {
        self.lookup("archetype", id, |t| {
            t.archetypes.get(id).and_then(|a| a.get("subProfessionName")).cloned()
        })
    }

    fn base(&self, id: &str) -> Value {
        self.lookup("base", id, |t| t.bases.get(id).cloned())
    }

    fn module(&self, id: &str) -> Value {
        self.lookup("module", id, |t| {
            let data = t.battle_equip.get(id).cloned().unwrap_or(Value::Null);
            t.modules.get(id).map(|info| json!({ "info": info, "data": data }))
        })
    }

    fn paradox(&self, char_id: &str) -> Value {
        self.lookup("paradox", char_id, |t| t.paradoxes.get(char_id).cloned())
    }

    fn range(&self, id: &str) -> Value {
        self.lookup("range", id, |t| t.ranges.get(id).cloned())
    }

    fn skill(&self, id: &str) -> Value {
        self.lookup("skill", id, |t| t.skills.get(id).cloned())
    }

    fn skins(&self, char_id: &str) -> Value {
        match self.lookup("skin", char_id, |t| t.skins.get(char_id).cloned().map(Value::Array)) {
            Value::Null => json!([]),
            skins => skins,
        }
    }

    /// Archetype name, final-phase range and skills.
    fn common(&self, data: &Value) -> (Value, Value, Value) {
        let archetype = opt_text(data, "subProfessionId")
            .map(|id| self.archetype(id))
            .unwrap_or(Value::Null);
        let range = array(data, "phases")
            .last()
            .and_then(|phase| opt_text(phase, "rangeId"))
            .map(|id| self.range(id))
            .unwrap_or(Value::Null);
        let skills = array(data, "skills")
            .iter()
            .map(|s| opt_text(s, "skillId").map(|id| self.skill(id)).unwrap_or(Value::Null))
            .collect::<Vec<_>>();
        (archetype, range, Value::Array(skills))
    }
}

/// Publishes `id -> value` for every document.
fn publish_by_canon(documents: &[PreDocument]) -> RegistryUpdate {
    documents
        .iter()
        .filter_map(|d| d.canon().map(|c| (c.to_string(), d.value.clone())))
        .collect()
}

struct ArchetypeStage;

impl Stage for ArchetypeStage {
    fn category(&self) -> &'static str {
        "archetype"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(UNIEQUIP_TABLE)]
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let table = artifacts.primary(UNIEQUIP_TABLE)?;
        let sub_profs = entries(member(table, UNIEQUIP_TABLE, "subProfDict")?, UNIEQUIP_TABLE)?;
        let mut documents = Vec::with_capacity(sub_profs.len());
        for sub_prof in sub_profs.values() {
            let id = text(sub_prof, UNIEQUIP_TABLE, "subProfessionId")?;
            let name = text(sub_prof, UNIEQUIP_TABLE, "subProfessionName")?;
            documents.push(PreDocument::new([id], json!(name)));
        }
        let registry = publish_by_canon(&documents);
        Ok(Extraction {
            documents,
            registry: Some(registry),
        })
    }
}

struct BaseStage;

impl Stage for BaseStage {
    fn category(&self) -> &'static str {
        "base"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(BUILDING_DATA)]
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let building = artifacts.primary(BUILDING_DATA)?;
        let buffs = entries(member(building, BUILDING_DATA, "buffs")?, BUILDING_DATA)?;
        let mut documents = Vec::with_capacity(buffs.len());
        for buff in buffs.values() {
            let id = text(buff, BUILDING_DATA, "buffId")?;
            documents.push(PreDocument::new([id], buff.clone()));
        }
        let registry = publish_by_canon(&documents);
        Ok(Extraction {
            documents,
            registry: Some(registry),
        })
    }
}

struct ModuleStage;

impl Stage for ModuleStage {
    fn category(&self) -> &'static str {
        "module"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![
            ArtifactRef::primary(UNIEQUIP_TABLE),
            ArtifactRef::primary(BATTLE_EQUIP_TABLE),
        ]
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let table = artifacts.primary(UNIEQUIP_TABLE)?;
        let battle = artifacts.primary(BATTLE_EQUIP_TABLE)?;
        let equips = entries(member(table, UNIEQUIP_TABLE, "equipDict")?, UNIEQUIP_TABLE)?;
        let mut documents = Vec::with_capacity(equips.len());
        for info in equips.values() {
            let id = text(info, UNIEQUIP_TABLE, "uniEquipId")?;
            let data = battle.get(id).cloned().unwrap_or(Value::Null);
            documents.push(PreDocument::new([id], json!({ "info": info, "data": data })));
        }
        let registry = publish_by_canon(&documents);
        Ok(Extraction {
            documents,
            registry: Some(registry),
        })
    }
}

struct ParadoxStage;

impl ParadoxStage {
    fn level_path(stage: &Value) -> Result<String, StageError> {
        let level_id = text(stage, HANDBOOK_INFO_TABLE, "levelId")?;
        Ok(format!("levels/{}.json", level_id.to_lowercase()))
    }
}

impl Stage for ParadoxStage {
    fn category(&self) -> &'static str {
        "paradox"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(HANDBOOK_INFO_TABLE)]
    }

    fn follow_ups(&self, fetched: &ArtifactSet, _registry: &LookupRegistry) -> Result<Vec<ArtifactRef>, StageError> {
        let handbook = fetched.primary(HANDBOOK_INFO_TABLE)?;
        let stages = entries(
            member(handbook, HANDBOOK_INFO_TABLE, "handbookStageData")?,
            HANDBOOK_INFO_TABLE,
        )?;
        stages
            .values()
            .map(|stage| Self::level_path(stage).map(ArtifactRef::primary))
            .collect()
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let handbook = artifacts.primary(HANDBOOK_INFO_TABLE)?;
        let stages = entries(
            member(handbook, HANDBOOK_INFO_TABLE, "handbookStageData")?,
            HANDBOOK_INFO_TABLE,
        )?;
        let mut documents = Vec::with_capacity(stages.len());
        for excel in stages.values() {
            let char_id = text(excel, HANDBOOK_INFO_TABLE, "charId")?;
            let stage_id = text(excel, HANDBOOK_INFO_TABLE, "stageId")?;
            let levels = artifacts.primary(&Self::level_path(excel)?)?;
            documents.push(PreDocument::new(
                [char_id, stage_id],
                json!({ "excel": excel, "levels": levels }),
            ));
        }
        let registry = publish_by_canon(&documents);
        Ok(Extraction {
            documents,
            registry: Some(registry),
        })
    }
}

struct RangeStage;

impl Stage for RangeStage {
    fn category(&self) -> &'static str {
        "range"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(RANGE_TABLE)]
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let ranges = entries(artifacts.primary(RANGE_TABLE)?, RANGE_TABLE)?;
        let mut documents = Vec::with_capacity(ranges.len());
        for range in ranges.values() {
            let id = text(range, RANGE_TABLE, "id")?;
            documents.push(PreDocument::new([id], range.clone()));
        }
        let registry = publish_by_canon(&documents);
        Ok(Extraction {
            documents,
            registry: Some(registry),
        })
    }
}

struct SkillStage;

impl Stage for SkillStage {
    fn category(&self) -> &'static str {
        "skill"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(SKILL_TABLE)]
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let skills = entries(artifacts.primary(SKILL_TABLE)?, SKILL_TABLE)?;
        let mut documents = Vec::with_capacity(skills.len());
        for skill in skills.values() {
            let id = text(skill, SKILL_TABLE, "skillId")?;
            documents.push(PreDocument::new([id], skill.clone()));
        }
        let registry = publish_by_canon(&documents);
        Ok(Extraction {
            documents,
            registry: Some(registry),
        })
    }
}

struct SkinStage;

impl Stage for SkinStage {
    fn category(&self) -> &'static str {
        "skin"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(SKIN_TABLE)]
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let table = artifacts.primary(SKIN_TABLE)?;
        let skins = entries(member(table, SKIN_TABLE, "charSkins")?, SKIN_TABLE)?;
        let mut documents = Vec::with_capacity(skins.len());
        // Published per operator, not per skin: operators join on their own id.
        let mut by_char: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for skin in skins.values() {
            let id = text(skin, SKIN_TABLE, "skinId")?;
            if let Some(char_id) = opt_text(skin, "charId") {
                by_char.entry(char_id.to_string()).or_default().push(skin.clone());
            }
            documents.push(PreDocument::new([id], skin.clone()));
        }
        let registry = by_char
            .into_iter()
            .map(|(char_id, list)| (char_id, Value::Array(list)))
            .collect();
        Ok(Extraction {
            documents,
            registry: Some(registry),
        })
    }
}

struct DeployableStage;

impl Stage for DeployableStage {
    fn category(&self) -> &'static str {
        "deployable"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["archetype", "range", "skill", "skin"]
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(CHARACTER_TABLE)]
    }

    fn extract(&self, artifacts: &ArtifactSet, registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let characters = entries(artifacts.primary(CHARACTER_TABLE)?, CHARACTER_TABLE)?;
        let mut documents = Vec::new();
        for (id, data) in characters.iter().filter(|(_, d)| is_deployable(d)) {
            let name = text(data, CHARACTER_TABLE, "name")?;
            let joins = Joins::primary(registry);
            let (archetype, range, skills) = joins.common(data);
            let lower = name.to_lowercase();
            documents.push(PreDocument::new(
                [id.clone(), lower.clone(), lower.replace(['\'', '-'], "")],
                json!({
                    "id": id,
                    "archetype": archetype,
                    "data": data,
                    "range": range,
                    "skills": skills,
                    "skins": joins.skins(id),
                }),
            ));
        }
        let registry = publish_by_canon(&documents);
        Ok(Extraction {
            documents,
            registry: Some(registry),
        })
    }
}

struct OperatorStage;

impl OperatorStage {
    fn record(
        id: &str,
        data: &Value,
        char_equip: &Value,
        base_chars: &Value,
        joins: &Joins<'_>,
    ) -> Value {
        let (archetype, range, skills) = joins.common(data);

        // The first module slot is the default, unlockable-by-everyone one.
        let modules = char_equip
            .get(id)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .filter(|m| !m.contains("uniequip_001"))
                    .map(|m| joins.module(m))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut bases = Vec::new();
        if let Some(base) = base_chars.get(id) {
            for buff in array(base, "buffChar") {
                for condition in array(buff, "buffData") {
                    let skill = opt_text(condition, "buffId")
                        .map(|b| joins.base(b))
                        .unwrap_or(Value::Null);
                    bases.push(json!({ "condition": condition, "skill": skill }));
                }
            }
        }

        json!({
            "id": id,
            "archetype": archetype,
            "bases": bases,
            "data": data,
            "modules": modules,
            "paradox": joins.paradox(id),
            "range": range,
            "skills": skills,
            "skins": joins.skins(id),
        })
    }
}

impl Stage for OperatorStage {
    fn category(&self) -> &'static str {
        "operator"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &[
            "archetype",
            "base",
            "module",
            "paradox",
            "range",
            "skill",
            "skin",
            "deployable",
        ]
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![
            ArtifactRef::primary(CHARACTER_TABLE),
            ArtifactRef::primary(CHAR_PATCH_TABLE),
            ArtifactRef::primary(UNIEQUIP_TABLE),
            ArtifactRef::primary(BUILDING_DATA),
        ]
    }

    fn extract(&self, artifacts: &ArtifactSet, registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let characters = entries(artifacts.primary(CHARACTER_TABLE)?, CHARACTER_TABLE)?;
        let patch = member(artifacts.primary(CHAR_PATCH_TABLE)?, CHAR_PATCH_TABLE, "patchChars")?;
        let patch_chars = entries(patch, CHAR_PATCH_TABLE)?;
        let char_equip = member(artifacts.primary(UNIEQUIP_TABLE)?, UNIEQUIP_TABLE, "charEquip")?;
        let base_chars = member(artifacts.primary(BUILDING_DATA)?, BUILDING_DATA, "chars")?;

        let joins = Joins::primary(registry);
        let mut documents = Vec::new();
        for (id, data) in characters.iter().chain(patch_chars.iter()) {
            if !is_operator(id, data) {
                continue;
            }
            let name = text(data, CHARACTER_TABLE, "name")?;
            let value = Self::record(id, data, char_equip, base_chars, &joins);
            documents.push(PreDocument::new(name_keys(id, name), value));
        }

        // Every alias resolves, so later stages can join on display names.
        let mut update = RegistryUpdate::new();
        for doc in &documents {
            for key in doc.lowercased_keys() {
                update.insert(key, doc.value.clone());
            }
        }
        Ok(Extraction {
            documents,
            registry: Some(update),
        })
    }
}

struct RecruitStage;

fn markup_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^<>]*>").expect("static pattern is valid"))
}

impl Stage for RecruitStage {
    fn category(&self) -> &'static str {
        "recruit"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["operator"]
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(GACHA_TABLE)]
    }

    fn extract(&self, artifacts: &ArtifactSet, registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let gacha = artifacts.primary(GACHA_TABLE)?;
        let detail = text(gacha, GACHA_TABLE, "recruitDetail")?;
        let plain = markup_pattern().replace_all(detail, "");

        // Pool lines list names separated by slashes; prose lines do not.
        let pool = plain
            .lines()
            .map(str::trim)
            .filter(|line| line.contains('/'))
            .flat_map(|line| line.split('/'))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                let id = registry
                    .get("operator", &name.to_lowercase())
                    .and_then(|op| op.get("id"))
                    .cloned()
                    .unwrap_or(Value::Null);
                json!({ "name": name, "id": id })
            })
            .collect::<Vec<_>>();

        Ok(Extraction {
            documents: vec![PreDocument::new(["recruit"], Value::Array(pool))],
            registry: None,
        })
    }
}

/// Operators that exist only in the secondary locale's dataset.
struct CrossLocaleOperatorStage;

impl Stage for CrossLocaleOperatorStage {
    fn category(&self) -> &'static str {
        "cn"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["operator"]
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        [
            CHARACTER_TABLE,
            CHAR_PATCH_TABLE,
            UNIEQUIP_TABLE,
            BUILDING_DATA,
            BATTLE_EQUIP_TABLE,
            HANDBOOK_INFO_TABLE,
            RANGE_TABLE,
            SKILL_TABLE,
            SKIN_TABLE,
        ]
        .into_iter()
        .map(ArtifactRef::secondary)
        .collect()
    }

    fn follow_ups(&self, fetched: &ArtifactSet, registry: &LookupRegistry) -> Result<Vec<ArtifactRef>, StageError> {
        let mut wanted = Vec::new();
        for excel in secondary_handbook(fetched)?.values() {
            let char_id = text(excel, HANDBOOK_INFO_TABLE, "charId")?;
            if registry.get("paradox", char_id).is_none() {
                wanted.push(ArtifactRef::secondary(ParadoxStage::level_path(excel)?));
            }
        }
        Ok(wanted)
    }

    fn extract(&self, artifacts: &ArtifactSet, registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let characters = entries(artifacts.secondary(CHARACTER_TABLE)?, CHARACTER_TABLE)?;
        let patch = member(artifacts.secondary(CHAR_PATCH_TABLE)?, CHAR_PATCH_TABLE, "patchChars")?;
        let patch_chars = entries(patch, CHAR_PATCH_TABLE)?;
        let char_equip = member(artifacts.secondary(UNIEQUIP_TABLE)?, UNIEQUIP_TABLE, "charEquip")?;
        let base_chars = member(artifacts.secondary(BUILDING_DATA)?, BUILDING_DATA, "chars")?;
        let joins = Joins {
            registry,
            secondary: Some(SecondaryTables::from_artifacts(artifacts)?),
        };

        let mut documents = Vec::new();
        for (id, data) in characters.iter().chain(patch_chars.iter()) {
            if !is_operator(id, data) || registry.get("operator", id).is_some() {
                continue;
            }
            let name = text(data, CHARACTER_TABLE, "name")?;
            let mut keys = vec![id.clone()];
            if let Some(appellation) = opt_text(data, "appellation") {
                keys.extend(name_keys(id, appellation).into_iter().skip(1));
            }
            keys.push(name.to_lowercase());
            let value = OperatorStage::record(id, data, char_equip, base_chars, &joins);
            documents.push(PreDocument::new(keys, value));
        }
        Ok(Extraction {
            documents,
            registry: None,
        })
    }
}

struct DefinitionStage;

impl Stage for DefinitionStage {
    fn category(&self) -> &'static str {
        "define"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(GAMEDATA_CONST)]
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let consts = artifacts.primary(GAMEDATA_CONST)?;
        let terms = entries(
            member(consts, GAMEDATA_CONST, "termDescriptionDict")?,
            GAMEDATA_CONST,
        )?;
        let mut documents = Vec::with_capacity(terms.len());
        for term in terms.values() {
            let id = text(term, GAMEDATA_CONST, "termId")?;
            let name = text(term, GAMEDATA_CONST, "termName")?;
            documents.push(PreDocument::new([id, name], term.clone()));
        }
        Ok(Extraction {
            documents,
            registry: None,
        })
    }
}

struct EnemyStage;

impl Stage for EnemyStage {
    fn category(&self) -> &'static str {
        "enemy"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![
            ArtifactRef::primary(ENEMY_HANDBOOK_TABLE),
            ArtifactRef::primary(ENEMY_DATABASE),
        ]
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let handbook = artifacts.primary(ENEMY_HANDBOOK_TABLE)?;
        let database = artifacts.primary(ENEMY_DATABASE)?;
        let enemies = entries(
            member(handbook, ENEMY_HANDBOOK_TABLE, "enemyData")?,
            ENEMY_HANDBOOK_TABLE,
        )?;

        let levels_by_id = array(database, "enemies")
            .iter()
            .filter_map(|e| opt_text(e, "Key").map(|k| (k, e)))
            .collect::<std::collections::HashMap<_, _>>();

        let mut documents = Vec::with_capacity(enemies.len());
        for excel in enemies.values() {
            let id = text(excel, ENEMY_HANDBOOK_TABLE, "enemyId")?;
            let name = text(excel, ENEMY_HANDBOOK_TABLE, "name")?;
            let mut keys = vec![id.to_string(), name.to_string(), name.replace('\'', "")];
            if let Some(index) = opt_text(excel, "enemyIndex") {
                keys.push(index.to_string());
            }
            let levels = levels_by_id.get(id).map(|v| (*v).clone()).unwrap_or(Value::Null);
            documents.push(PreDocument::new(keys, json!({ "excel": excel, "levels": levels })));
        }
        Ok(Extraction {
            documents,
            registry: None,
        })
    }
}

struct EventStage;

impl Stage for EventStage {
    fn category(&self) -> &'static str {
        "event"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(ACTIVITY_TABLE)]
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let activities = artifacts.primary(ACTIVITY_TABLE)?;
        let basic = entries(member(activities, ACTIVITY_TABLE, "basicInfo")?, ACTIVITY_TABLE)?;
        let mut documents = Vec::with_capacity(basic.len());
        for event in basic.values() {
            let id = text(event, ACTIVITY_TABLE, "id")?;
            documents.push(PreDocument::new([id], event.clone()));
        }
        Ok(Extraction {
            documents,
            registry: None,
        })
    }
}

struct ItemStage;

impl Stage for ItemStage {
    fn category(&self) -> &'static str {
        "item"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![
            ArtifactRef::primary(ITEM_TABLE),
            ArtifactRef::primary(BUILDING_DATA),
        ]
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let table = artifacts.primary(ITEM_TABLE)?;
        let building = artifacts.primary(BUILDING_DATA)?;
        let items = entries(member(table, ITEM_TABLE, "items")?, ITEM_TABLE)?;

        let mut documents = Vec::with_capacity(items.len());
        for data in items.values() {
            let id = text(data, ITEM_TABLE, "itemId")?;
            let name = text(data, ITEM_TABLE, "name")?;
            let formula = array(data, "buildingProductList")
                .first()
                .and_then(|product| {
                    let formulas = match opt_text(product, "roomType")? {
                        "MANUFACTURE" => "manufactFormulas",
                        "WORKSHOP" => "workshopFormulas",
                        _ => return None,
                    };
                    let formula_id = opt_text(product, "formulaId")?;
                    building.get(formulas)?.get(formula_id).cloned()
                })
                .unwrap_or(Value::Null);
            documents.push(PreDocument::new(
                [id.to_string(), name.to_string(), name.replace('\'', "")],
                json!({ "data": data, "formula": formula }),
            ));
        }
        Ok(Extraction {
            documents,
            registry: None,
        })
    }
}
