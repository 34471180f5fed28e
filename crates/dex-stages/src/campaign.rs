//! Stages for playable content: main and event stages, headhunting banners,
//! roguelike themes and sandbox themes. Most of them pull one level file per
//! stage as follow-up artifacts.

use std::cmp::Reverse;

use dex_core::PreDocument;
use serde_json::{json, Map, Value};

use crate::catalog::{entries, member, opt_text, text, GACHA_TABLE};
use crate::{ArtifactRef, ArtifactSet, Extraction, LookupRegistry, Stage, StageError};

const ROGUE_TABLE: &str = "excel/roguelike_topic_table.json";
const SANDBOX_TABLE: &str = "excel/sandbox_perm_table.json";
const STAGE_TABLE: &str = "excel/stage_table.json";

// Banner details need the official API, so only the newest client pools are kept.
const RECENT_GACHA_POOLS: usize = 12;

// Roguelike items of these types are squads and plays, not relics.
const SKIPPED_RELIC_TYPES: [&str; 2] = ["BAND", "CAPSULE"];

fn level_path(record: &Value, artifact: &str) -> Result<String, StageError> {
    let level_id = text(record, artifact, "levelId")?;
    Ok(format!("levels/{}.json", level_id.to_lowercase()))
}

fn field_or_null(table: &Value, outer: &str, inner: &str) -> Value {
    table
        .get(outer)
        .and_then(|t| t.get(inner))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Themes keyed `rogue_1`, `rogue_2`, ... in numeric order, so `rogue_10`
/// sorts after `rogue_9`.
fn ordered_themes(themes: &Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut ordered = themes.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|(id, _)| {
        let number = id.rsplit('_').next().and_then(|n| n.parse::<u32>().ok());
        (number.unwrap_or(u32::MAX), id.to_string())
    });
    ordered
}

/// Regular stages (`stage`) or challenge-mode variants (`toughstage`).
///
/// Each stage gets a document keyed by id, code and name; each code also gets
/// a document listing every stage that shares it.
pub(crate) struct StageTableStage {
    category: &'static str,
    tough: bool,
}

impl StageTableStage {
    pub(crate) const NORMAL: Self = Self {
        category: "stage",
        tough: false,
    };

    pub(crate) const TOUGH: Self = Self {
        category: "toughstage",
        tough: true,
    };

    fn selected<'a>(&self, table: &'a Value) -> Result<Vec<&'a Value>, StageError> {
        let stages = entries(member(table, STAGE_TABLE, "stages")?, STAGE_TABLE)?;
        Ok(stages
            .values()
            .filter(|excel| is_playable(excel) && self.wants(excel))
            .collect())
    }

    fn wants(&self, excel: &Value) -> bool {
        let difficulty = opt_text(excel, "difficulty");
        let tough = opt_text(excel, "diffGroup") == Some("TOUGH") || difficulty == Some("FOUR_STAR");
        if self.tough {
            tough
        } else {
            !tough && difficulty == Some("NORMAL")
        }
    }
}

/// Skips story-only and tutorial entries, easy-mode duplicates and the
/// extra-danger copies of climb-tower floors.
fn is_playable(excel: &Value) -> bool {
    let story_only = excel.get("isStoryOnly").and_then(Value::as_bool).unwrap_or(false);
    let stage_type = opt_text(excel, "stageType");
    if story_only || stage_type == Some("GUIDE") {
        return false;
    }
    let Some(level_id) = opt_text(excel, "levelId").map(str::to_lowercase) else {
        return false;
    };
    if level_id.contains("easy") {
        return false;
    }
    !(stage_type == Some("CLIMB_TOWER") && level_id.ends_with("_ex"))
}

/// `_m` variants share the base stage's level file, outside the mission folder.
fn stage_level_path(excel: &Value) -> Result<String, StageError> {
    let level_id = text(excel, STAGE_TABLE, "levelId")?.to_lowercase();
    let level_id = match level_id.strip_suffix("_m") {
        Some(base) if !base.is_empty() => base.replace("mission/", ""),
        _ => level_id,
    };
    Ok(format!("levels/{level_id}.json"))
}

impl Stage for StageTableStage {
    fn category(&self) -> &'static str {
        self.category
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(STAGE_TABLE)]
    }

    fn follow_ups(&self, fetched: &ArtifactSet, _registry: &LookupRegistry) -> Result<Vec<ArtifactRef>, StageError> {
        self.selected(fetched.primary(STAGE_TABLE)?)?
            .into_iter()
            .map(|excel| stage_level_path(excel).map(ArtifactRef::primary))
            .collect()
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let table = artifacts.primary(STAGE_TABLE)?;
        let mut documents = Vec::new();
        let mut by_code: Vec<(String, Vec<Value>)> = Vec::new();

        for excel in self.selected(table)? {
            let stage_id = text(excel, STAGE_TABLE, "stageId")?;
            let code = text(excel, STAGE_TABLE, "code")?;
            let levels = artifacts.primary(&stage_level_path(excel)?)?;
            let stage = json!({ "excel": excel, "levels": levels });

            let mut keys = vec![stage_id.to_string()];
            if self.tough {
                keys.push(stage_id.replace('#', ""));
            }
            keys.push(code.to_string());
            if let Some(name) = opt_text(excel, "name").filter(|n| !n.is_empty()) {
                keys.push(name.to_string());
            }
            documents.push(PreDocument::new(keys, json!([stage.clone()])));

            let code = code.to_lowercase();
            match by_code.iter_mut().find(|(c, _)| *c == code) {
                Some((_, list)) => list.push(stage),
                None => by_code.push((code, vec![stage])),
            }
        }

        documents.extend(
            by_code
                .into_iter()
                .map(|(code, list)| PreDocument::new([code], Value::Array(list))),
        );
        Ok(Extraction {
            documents,
            registry: None,
        })
    }
}

/// Headhunting banners, newest first.
pub(crate) struct GachaStage;

impl Stage for GachaStage {
    fn category(&self) -> &'static str {
        "gacha"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(GACHA_TABLE)]
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let table = artifacts.primary(GACHA_TABLE)?;
        let mut pools = member(table, GACHA_TABLE, "gachaPoolClient")?
            .as_array()
            .ok_or_else(|| StageError::shape(GACHA_TABLE, "`gachaPoolClient` is not an array"))?
            .iter()
            .collect::<Vec<_>>();
        pools.sort_by_key(|pool| Reverse(pool.get("openTime").and_then(Value::as_i64).unwrap_or(0)));

        let mut documents = Vec::with_capacity(RECENT_GACHA_POOLS);
        for pool in pools.into_iter().take(RECENT_GACHA_POOLS) {
            let id = text(pool, GACHA_TABLE, "gachaPoolId")?;
            documents.push(PreDocument::new([id], json!({ "client": pool })));
        }
        Ok(Extraction {
            documents,
            registry: None,
        })
    }
}

/// Roguelike themes, one document per theme holding its stages, relics and
/// floor variations.
pub(crate) struct RogueStage;

impl Stage for RogueStage {
    fn category(&self) -> &'static str {
        "rogue"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(ROGUE_TABLE)]
    }

    fn follow_ups(&self, fetched: &ArtifactSet, _registry: &LookupRegistry) -> Result<Vec<ArtifactRef>, StageError> {
        let details = entries(member(fetched.primary(ROGUE_TABLE)?, ROGUE_TABLE, "details")?, ROGUE_TABLE)?;
        let mut wanted = Vec::new();
        for (_, theme) in ordered_themes(details) {
            for excel in entries(member(theme, ROGUE_TABLE, "stages")?, ROGUE_TABLE)?.values() {
                wanted.push(ArtifactRef::primary(level_path(excel, ROGUE_TABLE)?));
            }
        }
        Ok(wanted)
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let table = artifacts.primary(ROGUE_TABLE)?;
        let details = entries(member(table, ROGUE_TABLE, "details")?, ROGUE_TABLE)?;
        let topics = member(table, ROGUE_TABLE, "topics")?;

        let mut documents = Vec::with_capacity(details.len());
        for (index, (theme_id, theme)) in ordered_themes(details).into_iter().enumerate() {
            let mut stages = Map::new();
            let mut tough_stages = Map::new();
            for excel in entries(member(theme, ROGUE_TABLE, "stages")?, ROGUE_TABLE)?.values() {
                let id = text(excel, ROGUE_TABLE, "id")?.to_lowercase();
                let levels = artifacts.primary(&level_path(excel, ROGUE_TABLE)?)?;
                let stage = json!({ "excel": excel, "levels": levels });
                match opt_text(excel, "difficulty") {
                    Some("FOUR_STAR") => tough_stages.insert(id, stage),
                    Some("NORMAL") => stages.insert(id, stage),
                    _ => None,
                };
            }

            let mut relics = Map::new();
            for relic in entries(member(theme, ROGUE_TABLE, "items")?, ROGUE_TABLE)?.values() {
                if opt_text(relic, "type").is_some_and(|t| SKIPPED_RELIC_TYPES.contains(&t)) {
                    continue;
                }
                relics.insert(text(relic, ROGUE_TABLE, "id")?.to_lowercase(), relic.clone());
            }

            let mut variations = Map::new();
            if let Some(data) = theme.get("variationData").and_then(Value::as_object) {
                for variation in data.values() {
                    variations.insert(text(variation, ROGUE_TABLE, "id")?.to_lowercase(), variation.clone());
                }
            }

            documents.push(PreDocument::new(
                [index.to_string(), theme_id.clone()],
                json!({
                    "name": field_or_null(topics, theme_id, "name"),
                    "stageDict": stages,
                    "toughStageDict": tough_stages,
                    "relicDict": relics,
                    "variationDict": variations,
                }),
            ));
        }
        Ok(Extraction {
            documents,
            registry: None,
        })
    }
}

/// Sandbox themes with their stages, items (joined to crafting and food
/// data) and weather.
pub(crate) struct SandboxStage;

impl SandboxStage {
    fn themes(table: &Value) -> Result<&Map<String, Value>, StageError> {
        let detail = member(table, SANDBOX_TABLE, "detail")?;
        entries(member(detail, SANDBOX_TABLE, "SANDBOX_V2")?, SANDBOX_TABLE)
    }
}

impl Stage for SandboxStage {
    fn category(&self) -> &'static str {
        "sandbox"
    }

    fn artifacts(&self) -> Vec<ArtifactRef> {
        vec![ArtifactRef::primary(SANDBOX_TABLE)]
    }

    fn follow_ups(&self, fetched: &ArtifactSet, _registry: &LookupRegistry) -> Result<Vec<ArtifactRef>, StageError> {
        let mut wanted = Vec::new();
        for (_, sandbox) in ordered_themes(Self::themes(fetched.primary(SANDBOX_TABLE)?)?) {
            for excel in entries(member(sandbox, SANDBOX_TABLE, "stageData")?, SANDBOX_TABLE)?.values() {
                wanted.push(ArtifactRef::primary(level_path(excel, SANDBOX_TABLE)?));
            }
        }
        Ok(wanted)
    }

    fn extract(&self, artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
        let table = artifacts.primary(SANDBOX_TABLE)?;
        let basic_info = member(table, SANDBOX_TABLE, "basicInfo")?;
        let items = entries(member(table, SANDBOX_TABLE, "itemData")?, SANDBOX_TABLE)?;
        let themes = Self::themes(table)?;

        let mut documents = Vec::with_capacity(themes.len());
        for (index, (theme_id, sandbox)) in ordered_themes(themes).into_iter().enumerate() {
            let mut stages = Map::new();
            for excel in entries(member(sandbox, SANDBOX_TABLE, "stageData")?, SANDBOX_TABLE)?.values() {
                let id = text(excel, SANDBOX_TABLE, "stageId")?.to_lowercase();
                let levels = artifacts.primary(&level_path(excel, SANDBOX_TABLE)?)?;
                stages.insert(id, json!({ "excel": excel, "levels": levels }));
            }

            let mut item_dict = Map::new();
            for item in items.values() {
                let id = text(item, SANDBOX_TABLE, "itemId")?.to_lowercase();
                let joined = json!({
                    "craft": field_or_null(sandbox, "craftItemData", &id),
                    "drink": field_or_null(sandbox, "drinkMatData", &id),
                    "foodMat": field_or_null(sandbox, "foodMatData", &id),
                    "food": field_or_null(sandbox, "foodData", &id),
                    "data": item,
                });
                item_dict.insert(id, joined);
            }

            let weather = sandbox.get("weatherData").cloned().unwrap_or_else(|| json!({}));
            documents.push(PreDocument::new(
                [index.to_string(), theme_id.clone()],
                json!({
                    "name": field_or_null(basic_info, theme_id, "topicName"),
                    "stageDict": stages,
                    "itemDict": item_dict,
                    "weatherDict": weather,
                }),
            ));
        }
        Ok(Extraction {
            documents,
            registry: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[(&str, Value)]) -> ArtifactSet {
        let mut set = ArtifactSet::new();
        for (path, value) in items {
            set.insert(ArtifactRef::primary(*path), value.clone());
        }
        set
    }

    fn with_follow_ups(stage: &dyn Stage, mut artifacts: ArtifactSet) -> ArtifactSet {
        let follow = stage.follow_ups(&artifacts, &LookupRegistry::new()).unwrap();
        for artifact in follow {
            let marker = json!({ "from": artifact.path.clone() });
            artifacts.insert(artifact, marker);
        }
        artifacts
    }

    fn stage_table() -> Value {
        json!({"stages": {
            "main_01-07": {"stageId": "main_01-07", "code": "1-7", "name": "Rearmed", "levelId": "Obt/Main/level_main_01-07", "difficulty": "NORMAL", "diffGroup": "NONE", "stageType": "MAIN"},
            "tough_01-07": {"stageId": "tough_01-07#f#", "code": "1-7", "name": "Rearmed", "levelId": "Obt/Main/level_main_01-07", "difficulty": "FOUR_STAR", "diffGroup": "TOUGH", "stageType": "MAIN"},
            "act21side_01_m": {"stageId": "act21side_01_m", "code": "SN-1", "name": null, "levelId": "Activities/act21side/mission/level_act21side_01_m", "difficulty": "NORMAL", "diffGroup": "NONE", "stageType": "ACTIVITY"},
            "main_00-01": {"stageId": "main_00-01", "code": "0-1", "name": "Tutorial", "levelId": "Obt/Main/level_main_00-01", "difficulty": "NORMAL", "isStoryOnly": false, "stageType": "GUIDE"},
            "main_01-07_easy": {"stageId": "main_01-07_easy", "code": "1-7", "name": "Rearmed", "levelId": "Obt/Main/level_easy_sub_main_01-07", "difficulty": "NORMAL", "stageType": "MAIN"},
            "tower_n_1_ex": {"stageId": "tower_n_1_ex", "code": "SSS-1", "name": "Floor", "levelId": "Obt/Tower/level_tower_n_1_ex", "difficulty": "NORMAL", "stageType": "CLIMB_TOWER"}
        }})
    }

    #[test]
    fn regular_stages_skip_guides_easy_and_tower_extras() {
        let artifacts = with_follow_ups(&StageTableStage::NORMAL, set(&[(STAGE_TABLE, stage_table())]));
        assert!(artifacts.contains(&ArtifactRef::primary("levels/activities/act21side/level_act21side_01.json")));

        let extraction = StageTableStage::NORMAL
            .extract(&artifacts, &LookupRegistry::new())
            .unwrap();
        let mut canons = extraction
            .documents
            .iter()
            .filter_map(PreDocument::canon)
            .collect::<Vec<_>>();
        canons.sort_unstable();
        assert_eq!(canons, vec!["1-7", "act21side_01_m", "main_01-07", "sn-1"]);

        let main = extraction
            .documents
            .iter()
            .find(|doc| doc.canon() == Some("main_01-07"))
            .unwrap();
        assert_eq!(main.keys, vec!["main_01-07", "1-7", "Rearmed"]);
        assert_eq!(
            main.value[0]["levels"],
            json!({"from": "levels/obt/main/level_main_01-07.json"})
        );
    }

    #[test]
    fn tough_stages_add_a_hashless_id_and_group_by_code() {
        let artifacts = with_follow_ups(&StageTableStage::TOUGH, set(&[(STAGE_TABLE, stage_table())]));
        let extraction = StageTableStage::TOUGH
            .extract(&artifacts, &LookupRegistry::new())
            .unwrap();
        assert_eq!(extraction.documents.len(), 2);
        assert_eq!(
            extraction.documents[0].keys,
            vec!["tough_01-07#f#", "tough_01-07f", "1-7", "Rearmed"]
        );
        assert_eq!(extraction.documents[1].canon(), Some("1-7"));
        assert_eq!(extraction.documents[1].value.as_array().unwrap().len(), 1);
    }

    #[test]
    fn gacha_keeps_the_newest_pools() {
        let pools = (0..15)
            .map(|i| json!({"gachaPoolId": format!("pool_{i:02}"), "openTime": i * 100}))
            .collect::<Vec<_>>();
        let artifacts = set(&[(GACHA_TABLE, json!({ "gachaPoolClient": pools }))]);
        let extraction = GachaStage.extract(&artifacts, &LookupRegistry::new()).unwrap();
        assert_eq!(extraction.documents.len(), RECENT_GACHA_POOLS);
        assert_eq!(extraction.documents[0].canon(), Some("pool_14"));
        assert_eq!(extraction.documents[11].canon(), Some("pool_03"));
        assert_eq!(extraction.documents[0].value["client"]["openTime"], json!(1400));
    }

    #[test]
    fn rogue_themes_split_stages_and_drop_squads() {
        let theme = |stage: &str| {
            let mut stages = Map::new();
            stages.insert(
                stage.to_string(),
                json!({"id": stage.to_uppercase(), "levelId": format!("Obt/Roguelike/{stage}"), "difficulty": "NORMAL"}),
            );
            stages.insert(
                "ro_hard".to_string(),
                json!({"id": "ro_hard", "levelId": "Obt/Roguelike/ro_hard", "difficulty": "FOUR_STAR"}),
            );
            json!({
                "stages": stages,
                "items": {
                    "rogue_1_relic_a1": {"id": "rogue_1_relic_a1", "type": "RELIC", "name": "Relic"},
                    "rogue_1_band_1": {"id": "rogue_1_band_1", "type": "BAND", "name": "Squad"}
                }
            })
        };
        let table = json!({
            "topics": {"rogue_10": {"name": "Tenth"}, "rogue_2": {"name": "Second"}},
            "details": {"rogue_10": theme("ro_ten"), "rogue_2": theme("ro_two")}
        });
        let artifacts = with_follow_ups(&RogueStage, set(&[(ROGUE_TABLE, table)]));
        let extraction = RogueStage.extract(&artifacts, &LookupRegistry::new()).unwrap();

        let second = &extraction.documents[0];
        assert_eq!(second.keys, vec!["0", "rogue_2"]);
        assert_eq!(second.value["name"], json!("Second"));
        assert!(second.value["stageDict"].get("ro_two").is_some());
        assert!(second.value["toughStageDict"].get("ro_hard").is_some());
        assert_eq!(second.value["relicDict"].as_object().unwrap().len(), 1);
        assert_eq!(second.value["variationDict"], json!({}));
        assert_eq!(extraction.documents[1].keys, vec!["1", "rogue_10"]);
    }

    #[test]
    fn sandbox_items_join_crafting_and_food() {
        let table = json!({
            "basicInfo": {"sandbox_1": {"topicName": "Fire Within the Sand"}},
            "detail": {"SANDBOX_V2": {"sandbox_1": {
                "stageData": {"sb_1": {"stageId": "SB_1", "levelId": "Obt/Sandbox/sb_1"}},
                "craftItemData": {"sandbox_1_knife": {"cost": 3}},
                "foodData": {},
                "weatherData": {"w_rain": {"weatherId": "w_rain", "name": "Rain"}}
            }}},
            "itemData": {"sandbox_1_knife": {"itemId": "sandbox_1_knife", "itemName": "Knife"}}
        });
        let artifacts = with_follow_ups(&SandboxStage, set(&[(SANDBOX_TABLE, table)]));
        let extraction = SandboxStage.extract(&artifacts, &LookupRegistry::new()).unwrap();
        let doc = &extraction.documents[0];
        assert_eq!(doc.keys, vec!["0", "sandbox_1"]);
        assert_eq!(doc.value["name"], json!("Fire Within the Sand"));
        let knife = &doc.value["itemDict"]["sandbox_1_knife"];
        assert_eq!(knife["craft"], json!({"cost": 3}));
        assert_eq!(knife["food"], Value::Null);
        assert_eq!(doc.value["stageDict"]["sb_1"]["levels"], json!({"from": "levels/obt/sandbox/sb_1.json"}));
        assert_eq!(doc.value["weatherDict"]["w_rain"]["name"], json!("Rain"));
    }

    #[test]
    fn stage_rows_without_levels_are_skipped() {
        assert!(!is_playable(&json!({"stageType": "MAIN", "difficulty": "NORMAL"})));
        assert!(is_playable(&json!({"stageType": "MAIN", "levelId": "Obt/Main/level_main_01-01"})));
    }
}
