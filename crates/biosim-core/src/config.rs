//! Scenario configuration.
//!
//! A scenario is read once from TOML or JSON, checked in full and frozen
//! into `Definitions`, which the engine shares read-only for the whole run.
//! Numeric kinetic parameters and set-points may name an entry of the
//! `[constants]` table instead of giving a literal.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::components::{
    EntityId, EntityKind, EntitySpec, LifecycleState, Quantities, Quantity, Unit,
};
use crate::error::{SimError, SimResult};
use crate::generation::generate_population;
use crate::relations::{RelationGraph, RelationLabel};
use crate::scheduler::TickMode;
use crate::systems::{
    Aggregate, ContentionPolicy, Effect, LifecycleRule, ProcessDef, QuantityRef, RateLaw,
    RegulatoryLoop, Requirement, StoichTerm, Trigger,
};

fn default_tolerance() -> f64 {
    1e-9
}

/// Run-wide settings, `[simulation]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    #[serde(default)]
    pub tick: TickMode,
    #[serde(default)]
    pub contention: ContentionPolicy,
    /// Evaluate process instances on the rayon pool
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub seed: u64,
    /// Slack for threshold and set-point comparisons
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tick: TickMode::default(),
            contention: ContentionPolicy::default(),
            parallel: false,
            seed: 0,
            tolerance: default_tolerance(),
        }
    }
}

/// A literal number or the name of a constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Constant(String),
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

/// Named immutable biological constants (Km values, set-points, ...)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimConstants {
    values: BTreeMap<String, f64>,
}

impl SimConstants {
    pub fn new(values: BTreeMap<String, f64>) -> SimResult<Self> {
        if let Some((name, v)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(SimError::config(format!("constant '{}' is not finite ({})", name, v)));
        }
        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn resolve(&self, param: &ParamValue, context: &str) -> SimResult<f64> {
        match param {
            ParamValue::Number(v) => Ok(*v),
            ParamValue::Constant(name) => self.get(name).ok_or_else(|| {
                SimError::config(format!("{}: unknown constant '{}'", context, name))
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTypeConfig {
    pub name: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub initial_state: Option<LifecycleState>,
    #[serde(default)]
    pub quantities: BTreeMap<String, Quantity>,
    /// Extra conserved quantities beyond the concentration/mass defaults
    #[serde(default)]
    pub conserved: Vec<String>,
}

/// An explicit initial entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub state: Option<LifecycleState>,
    #[serde(default)]
    pub entered_at: Option<f64>,
    /// Overrides of template values, in the template's units
    #[serde(default)]
    pub quantities: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationConfig {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub count: usize,
    /// Relative jitter applied to every template quantity
    #[serde(default)]
    pub jitter: f64,
    #[serde(default)]
    pub state: Option<LifecycleState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RateLawConfig {
    ZeroOrder {
        k: ParamValue,
    },
    FirstOrder {
        k: ParamValue,
        substrate: QuantityRef,
    },
    MichaelisMenten {
        vmax: ParamValue,
        km: ParamValue,
        substrate: QuantityRef,
    },
    Hill {
        vmax: ParamValue,
        k_half: ParamValue,
        n: ParamValue,
        substrate: QuantityRef,
    },
}

impl RateLawConfig {
    fn resolve(&self, constants: &SimConstants, context: &str) -> SimResult<RateLaw> {
        let r = |p: &ParamValue| constants.resolve(p, context);
        Ok(match self {
            RateLawConfig::ZeroOrder { k } => RateLaw::ZeroOrder { k: r(k)? },
            RateLawConfig::FirstOrder { k, substrate } => RateLaw::FirstOrder {
                k: r(k)?,
                substrate: substrate.clone(),
            },
            RateLawConfig::MichaelisMenten {
                vmax,
                km,
                substrate,
            } => RateLaw::MichaelisMenten {
                vmax: r(vmax)?,
                km: r(km)?,
                substrate: substrate.clone(),
            },
            RateLawConfig::Hill {
                vmax,
                k_half,
                n,
                substrate,
            } => RateLaw::Hill {
                vmax: r(vmax)?,
                k_half: r(k_half)?,
                n: r(n)?,
                substrate: substrate.clone(),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub name: String,
    pub subject: String,
    pub rate_law: RateLawConfig,
    /// Extent unit; defaults to the substrate's unit, else the first term's
    #[serde(default)]
    pub unit: Option<Unit>,
    pub terms: Vec<StoichTerm>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub cofactor: Option<Requirement>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub required_state: Option<LifecycleState>,
    #[serde(default)]
    pub period: Option<ParamValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulatorConfig {
    pub name: String,
    pub entity_type: String,
    pub quantity: String,
    #[serde(default)]
    pub aggregate: Aggregate,
    pub set_point: ParamValue,
    pub deadband: ParamValue,
    #[serde(default)]
    pub low_group: Option<String>,
    #[serde(default)]
    pub high_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationConfig {
    pub from: String,
    pub to: String,
    pub label: RelationLabel,
}

/// Raw scenario as written on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub constants: BTreeMap<String, f64>,
    #[serde(default)]
    pub entity_types: Vec<EntityTypeConfig>,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub populations: Vec<PopulationConfig>,
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
    #[serde(default)]
    pub lifecycle_rules: Vec<LifecycleRule>,
    #[serde(default)]
    pub regulators: Vec<RegulatorConfig>,
    #[serde(default)]
    pub relations: Vec<RelationConfig>,
}

impl ScenarioConfig {
    pub fn from_toml_str(text: &str) -> SimResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> SimResult<Self> {
        serde_json::from_str(text).map_err(|e| SimError::config(e.to_string()))
    }

    /// Load by extension (`.toml` or `.json`)
    pub fn from_path(path: impl AsRef<Path>) -> SimResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("json") => Self::from_json_str(&text),
            _ => Err(SimError::config(format!(
                "{}: expected a .toml or .json scenario",
                path.display()
            ))),
        }
    }
}

/// Entity type, doubling as the spawn template
#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    pub name: String,
    pub kind: EntityKind,
    pub initial_state: LifecycleState,
    pub quantities: Quantities,
}

impl EntityType {
    pub fn instantiate(&self) -> EntitySpec {
        EntitySpec {
            id: None,
            type_name: self.name.clone(),
            kind: self.kind,
            state: self.initial_state,
            entered_at: None,
            quantities: self.quantities.clone(),
        }
    }
}

/// Validated, immutable scenario
#[derive(Debug, Clone)]
pub struct Definitions {
    pub name: String,
    pub settings: SimulationSettings,
    pub constants: SimConstants,
    pub types: BTreeMap<String, EntityType>,
    /// Initial entities, explicit ids first
    pub initial: Vec<EntitySpec>,
    pub processes: Vec<ProcessDef>,
    pub lifecycle_rules: Vec<LifecycleRule>,
    pub regulators: Vec<RegulatoryLoop>,
    pub relations: RelationGraph,
}

impl Definitions {
    pub fn from_config(config: ScenarioConfig) -> SimResult<Self> {
        let settings = config.simulation;
        settings.tick.validate().map_err(SimError::config)?;
        if !(settings.tolerance >= 0.0 && settings.tolerance.is_finite()) {
            return Err(SimError::config(format!(
                "tolerance must be non-negative (got {})",
                settings.tolerance
            )));
        }
        let constants = SimConstants::new(config.constants)?;

        let types = build_types(config.entity_types)?;
        let regulators = build_regulators(config.regulators, &types, &constants)?;
        let groups: BTreeSet<&str> = regulators.iter().flat_map(|r| r.groups()).collect();

        let processes = build_processes(config.processes, &types, &constants, &groups)?;
        check_lifecycle_rules(&config.lifecycle_rules, &types, &groups)?;

        for group in &groups {
            let used = processes.iter().any(|p| p.group.as_deref() == Some(*group))
                || config.lifecycle_rules.iter().any(
                    |r| matches!(&r.trigger, Trigger::Signal { group: g } if g == group),
                );
            if !used {
                log::warn!("Corrective group '{}' drives no process or rule", group);
            }
        }

        let mut initial = build_entities(config.entities, &types)?;
        let mut rng = StdRng::seed_from_u64(settings.seed);
        for population in &config.populations {
            let template = types.get(&population.entity_type).ok_or_else(|| {
                SimError::config(format!(
                    "population: unknown entity type '{}'",
                    population.entity_type
                ))
            })?;
            if !(0.0..1.0).contains(&population.jitter) {
                return Err(SimError::config(format!(
                    "population of '{}': jitter must be in [0, 1) (got {})",
                    population.entity_type, population.jitter
                )));
            }
            if let Some(state) = population.state {
                check_state(template, state, "population")?;
            }
            initial.extend(generate_population(
                template,
                population.count,
                population.jitter,
                population.state,
                &mut rng,
            ));
        }

        let relations = build_relations(&config.relations, &types, &processes, &regulators)?;

        let definitions = Self {
            name: config.name,
            settings,
            constants,
            types,
            initial,
            processes,
            lifecycle_rules: config.lifecycle_rules,
            regulators,
            relations,
        };
        log::info!(
            "Loaded scenario '{}': {} types, {} entities, {} processes, {} lifecycle rules, {} regulators",
            definitions.name,
            definitions.types.len(),
            definitions.initial.len(),
            definitions.processes.len(),
            definitions.lifecycle_rules.len(),
            definitions.regulators.len()
        );
        Ok(definitions)
    }

    pub fn from_toml_str(text: &str) -> SimResult<Self> {
        Self::from_config(ScenarioConfig::from_toml_str(text)?)
    }

    pub fn process(&self, name: &str) -> Option<&ProcessDef> {
        self.processes.iter().find(|p| p.name == name)
    }

    pub fn regulator(&self, name: &str) -> Option<&RegulatoryLoop> {
        self.regulators.iter().find(|r| r.name == name)
    }
}

fn unique<'a>(section: &str, names: impl Iterator<Item = &'a str>) -> SimResult<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(SimError::config(format!("{}: duplicate name '{}'", section, name)));
        }
    }
    Ok(())
}

fn check_state(ty: &EntityType, state: LifecycleState, context: &str) -> SimResult<()> {
    if ty.kind.lifecycle().contains(state) {
        Ok(())
    } else {
        Err(SimError::config(format!(
            "{}: state {} is not part of the {} lifecycle",
            context, state, ty.kind
        )))
    }
}

fn build_types(configs: Vec<EntityTypeConfig>) -> SimResult<BTreeMap<String, EntityType>> {
    unique("entity_types", configs.iter().map(|t| t.name.as_str()))?;

    let mut types = BTreeMap::new();
    for config in configs {
        let mut quantities = Quantities::new();
        for (name, q) in config.quantities {
            quantities.insert(name, q);
        }
        for name in &config.conserved {
            if !quantities.mark_conserved(name) {
                return Err(SimError::config(format!(
                    "entity type '{}': conserved quantity '{}' is not declared",
                    config.name, name
                )));
            }
        }
        if let Some((name, v)) = quantities.first_invalid() {
            return Err(SimError::config(format!(
                "entity type '{}': quantity '{}' has invalid initial value {}",
                config.name, name, v
            )));
        }
        let ty = EntityType {
            initial_state: config
                .initial_state
                .unwrap_or(config.kind.lifecycle().initial),
            name: config.name,
            kind: config.kind,
            quantities,
        };
        check_state(&ty, ty.initial_state, &format!("entity type '{}'", ty.name))?;
        types.insert(ty.name.clone(), ty);
    }
    Ok(types)
}

fn build_entities(
    configs: Vec<EntityConfig>,
    types: &BTreeMap<String, EntityType>,
) -> SimResult<Vec<EntitySpec>> {
    let mut ids = BTreeSet::new();
    let mut explicit = Vec::new();
    let mut allocated = Vec::new();

    for config in configs {
        let template = types.get(&config.entity_type).ok_or_else(|| {
            SimError::config(format!("entity: unknown entity type '{}'", config.entity_type))
        })?;
        let mut spec = template.instantiate();
        for (name, value) in &config.quantities {
            if !spec.quantities.set_value(name, *value) {
                return Err(SimError::config(format!(
                    "entity of type '{}': '{}' is not a quantity of the type",
                    config.entity_type, name
                )));
            }
        }
        if let Some((name, v)) = spec.quantities.first_invalid() {
            return Err(SimError::config(format!(
                "entity of type '{}': quantity '{}' has invalid value {}",
                config.entity_type, name, v
            )));
        }
        if let Some(state) = config.state {
            check_state(template, state, &format!("entity of type '{}'", config.entity_type))?;
            spec.state = state;
        }
        spec.entered_at = config.entered_at;

        match config.id {
            Some(id) => {
                if id == 0 || !ids.insert(id) {
                    return Err(SimError::config(format!("entity id {} is invalid or repeated", id)));
                }
                spec.id = Some(EntityId(id));
                explicit.push(spec);
            }
            None => allocated.push(spec),
        }
    }
    explicit.extend(allocated);
    Ok(explicit)
}

fn build_regulators(
    configs: Vec<RegulatorConfig>,
    types: &BTreeMap<String, EntityType>,
    constants: &SimConstants,
) -> SimResult<Vec<RegulatoryLoop>> {
    unique("regulators", configs.iter().map(|r| r.name.as_str()))?;

    let mut loops = Vec::with_capacity(configs.len());
    for config in configs {
        let context = format!("regulator '{}'", config.name);
        let ty = types.get(&config.entity_type).ok_or_else(|| {
            SimError::config(format!("{}: unknown entity type '{}'", context, config.entity_type))
        })?;
        if !ty.quantities.contains(&config.quantity) {
            return Err(SimError::config(format!(
                "{}: type '{}' has no quantity '{}'",
                context, config.entity_type, config.quantity
            )));
        }
        let set_point = constants.resolve(&config.set_point, &context)?;
        let deadband = constants.resolve(&config.deadband, &context)?;
        if !set_point.is_finite() {
            return Err(SimError::config(format!("{}: set point is not finite", context)));
        }
        if !(deadband >= 0.0 && deadband.is_finite()) {
            return Err(SimError::config(format!(
                "{}: deadband must be non-negative (got {})",
                context, deadband
            )));
        }
        if config.low_group.is_some() && config.low_group == config.high_group {
            return Err(SimError::config(format!(
                "{}: low and high corrective groups must differ",
                context
            )));
        }
        loops.push(RegulatoryLoop {
            name: config.name,
            entity_type: config.entity_type,
            quantity: config.quantity,
            aggregate: config.aggregate,
            set_point,
            deadband,
            low_group: config.low_group,
            high_group: config.high_group,
        });
    }
    Ok(loops)
}

/// Template quantity a reference lands on
fn referenced<'t>(
    types: &'t BTreeMap<String, EntityType>,
    subject: &str,
    target: &QuantityRef,
    context: &str,
) -> SimResult<Quantity> {
    let type_name = target.entity_type(subject);
    let ty = types.get(type_name).ok_or_else(|| {
        SimError::config(format!("{}: unknown entity type '{}'", context, type_name))
    })?;
    ty.quantities.get(&target.quantity).ok_or_else(|| {
        SimError::config(format!(
            "{}: type '{}' has no quantity '{}'",
            context, type_name, target.quantity
        ))
    })
}

fn build_processes(
    configs: Vec<ProcessConfig>,
    types: &BTreeMap<String, EntityType>,
    constants: &SimConstants,
    groups: &BTreeSet<&str>,
) -> SimResult<Vec<ProcessDef>> {
    unique("processes", configs.iter().map(|p| p.name.as_str()))?;

    let mut processes = Vec::with_capacity(configs.len());
    for config in configs {
        let context = format!("process '{}'", config.name);
        let subject = types.get(&config.subject).ok_or_else(|| {
            SimError::config(format!("{}: unknown subject type '{}'", context, config.subject))
        })?;
        let rate_law = config.rate_law.resolve(constants, &context)?;
        rate_law
            .validate()
            .map_err(|reason| SimError::config(format!("{}: {}", context, reason)))?;
        if config.terms.is_empty() {
            return Err(SimError::config(format!("{}: no stoichiometric terms", context)));
        }
        let unit = match (config.unit, rate_law.substrate()) {
            (Some(unit), _) => unit,
            (None, Some(substrate)) => referenced(types, &config.subject, substrate, &context)?.unit,
            (None, None) => {
                referenced(types, &config.subject, &config.terms[0].target, &context)?.unit
            }
        };
        for term in &config.terms {
            let target = referenced(types, &config.subject, &term.target, &context)?;
            if !term.coefficient.is_finite() {
                return Err(SimError::config(format!("{}: coefficient is not finite", context)));
            }
            if let Some(declared) = term.unit {
                if declared != target.unit {
                    return Err(SimError::config(format!(
                        "{}: term on '{}' declares {} but the quantity is {}",
                        context, term.target.quantity, declared, target.unit
                    )));
                }
            }
            let delta = term
                .delta(Quantity::new(1.0, unit))
                .map_err(|reason| SimError::config(format!("{}: {}", context, reason)))?;
            if delta.unit != target.unit {
                return Err(SimError::config(format!(
                    "{}: a {} extent cannot change '{}' ({})",
                    context, unit, term.target.quantity, target.unit
                )));
            }
        }
        if let Some(group) = &config.group {
            if !groups.contains(group.as_str()) {
                return Err(SimError::config(format!(
                    "{}: no regulator activates group '{}'",
                    context, group
                )));
            }
        }
        if let Some(state) = config.required_state {
            check_state(subject, state, &context)?;
        }
        let period = match &config.period {
            Some(p) => {
                let period = constants.resolve(p, &context)?;
                if !(period > 0.0 && period.is_finite()) {
                    return Err(SimError::config(format!(
                        "{}: period must be positive (got {})",
                        context, period
                    )));
                }
                Some(period)
            }
            None => None,
        };

        let process = ProcessDef {
            name: config.name,
            subject: config.subject,
            rate_law,
            unit,
            terms: config.terms,
            requirements: config.requirements,
            cofactor: config.cofactor,
            group: config.group,
            required_state: config.required_state,
            period,
        };
        for target in process.references() {
            referenced(types, &process.subject, target, &context)?;
        }
        processes.push(process);
    }
    Ok(processes)
}

fn check_lifecycle_rules(
    rules: &[LifecycleRule],
    types: &BTreeMap<String, EntityType>,
    groups: &BTreeSet<&str>,
) -> SimResult<()> {
    unique("lifecycle_rules", rules.iter().map(|r| r.name.as_str()))?;

    for rule in rules {
        let context = format!("lifecycle rule '{}'", rule.name);
        let ty = types.get(&rule.entity_type).ok_or_else(|| {
            SimError::config(format!("{}: unknown entity type '{}'", context, rule.entity_type))
        })?;
        if !ty.kind.lifecycle().allows(rule.from, rule.to) {
            return Err(SimError::config(format!(
                "{}: {} -> {} is not a {} lifecycle edge",
                context, rule.from, rule.to, ty.kind
            )));
        }
        match &rule.trigger {
            Trigger::Timed { dwell } if !(*dwell >= 0.0 && dwell.is_finite()) => {
                return Err(SimError::config(format!(
                    "{}: dwell must be non-negative (got {})",
                    context, dwell
                )));
            }
            Trigger::Threshold {
                quantity,
                above,
                below,
            } => {
                if !ty.quantities.contains(quantity) {
                    return Err(SimError::config(format!(
                        "{}: type '{}' has no quantity '{}'",
                        context, rule.entity_type, quantity
                    )));
                }
                if above.is_none() && below.is_none() {
                    return Err(SimError::config(format!(
                        "{}: threshold needs 'above' or 'below'",
                        context
                    )));
                }
            }
            Trigger::Signal { group } if !groups.contains(group.as_str()) => {
                return Err(SimError::config(format!(
                    "{}: no regulator activates group '{}'",
                    context, group
                )));
            }
            _ => {}
        }
        for effect in &rule.effects {
            if let Effect::Spawn { entity_type } = effect {
                if !types.contains_key(entity_type) {
                    return Err(SimError::config(format!(
                        "{}: cannot spawn unknown type '{}'",
                        context, entity_type
                    )));
                }
            }
        }
    }
    Ok(())
}

fn build_relations(
    configs: &[RelationConfig],
    types: &BTreeMap<String, EntityType>,
    processes: &[ProcessDef],
    regulators: &[RegulatoryLoop],
) -> SimResult<RelationGraph> {
    let mut graph = RelationGraph::new();
    for relation in configs {
        for end in [&relation.from, &relation.to] {
            if !types.contains_key(end) {
                return Err(SimError::config(format!(
                    "relation {} -> {}: unknown entity type '{}'",
                    relation.from, relation.to, end
                )));
            }
        }
        graph.add(&relation.from, &relation.to, relation.label);
    }

    for process in processes {
        for term in &process.terms {
            let target = term.target.entity_type(&process.subject);
            if target == process.subject {
                continue;
            }
            let label = if term.coefficient < 0.0 {
                RelationLabel::Consumes
            } else {
                RelationLabel::Produces
            };
            graph.add(&process.subject, target, label);
        }
        for req in process.requirements.iter().chain(process.cofactor.iter()) {
            let target = req.target.entity_type(&process.subject);
            if target != process.subject {
                graph.add(&process.subject, target, RelationLabel::DependsOn);
            }
        }
    }

    for lp in regulators {
        for group in lp.groups() {
            for process in processes.iter().filter(|p| p.group.as_deref() == Some(group)) {
                graph.add(&lp.entity_type, &process.subject, RelationLabel::Regulates);
            }
        }
    }
    Ok(graph)
}
