//! Derivation of the FLAME execution model from an analyzed script.
//!
//! Both FLAME targets run agent functions that communicate exclusively via
//! message lists. A step function that reads neighbor state through `near`
//! is split in two: a *publish* function that posts the pre-step values of
//! the read members to a message list, and an *update* function that
//! consumes the list and writes the new state. Readers therefore always see
//! the snapshot from the start of the tick. Functions are placed in layers
//! so that every publish runs strictly before its consumers.
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::analysis::Type;
use crate::parser::ast::{AgentDeclaration, Script};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlameMessage {
    pub name: String,
    /// Payload members in agent declaration order (position first members
    /// included), still packed (vectors intact).
    pub members: Vec<(String, Type)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlameFuncKind {
    /// Posts pre-step state to the message list.
    Publish,
    /// Runs the (possibly rewritten) step body.
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlameFunc {
    pub name: String,
    pub kind: FlameFuncKind,
    /// Agent type this function runs on.
    pub agent: String,
    /// The step function it was derived from.
    pub source_fn: String,
    pub in_msg: Option<String>,
    pub out_msg: Option<String>,
    pub uses_rng: bool,
    pub added_agent: Option<String>,
    pub layer: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlameModel {
    pub messages: Vec<FlameMessage>,
    pub funcs: Vec<FlameFunc>,
    pub layer_count: usize,
}

impl FlameModel {
    pub fn from_script(script: &Script) -> FlameModel {
        let mut model = FlameModel::default();

        for func in script.step_functions() {
            let Some(agent_name) = func.step_agent() else {
                continue;
            };
            let Some(agent) = script.agent(agent_name) else {
                continue;
            };

            let uses_rng = func.info.uses_rng;
            let added_agent = func.info.added_agents.first().cloned();

            if func.info.uses_near {
                let msg_name = format!("{}_message", func.name);
                model.messages.push(FlameMessage {
                    name: msg_name.clone(),
                    members: message_members(agent, &func.info.near_members),
                });

                model.funcs.push(FlameFunc {
                    name: format!("{}_publish", func.name),
                    kind: FlameFuncKind::Publish,
                    agent: agent_name.to_owned(),
                    source_fn: func.name.clone(),
                    in_msg: None,
                    out_msg: Some(msg_name.clone()),
                    uses_rng: false,
                    added_agent: None,
                    layer: 0,
                });
                model.funcs.push(FlameFunc {
                    name: func.name.clone(),
                    kind: FlameFuncKind::Update,
                    agent: agent_name.to_owned(),
                    source_fn: func.name.clone(),
                    in_msg: Some(msg_name),
                    out_msg: None,
                    uses_rng,
                    added_agent,
                    layer: 0,
                });
            } else {
                model.funcs.push(FlameFunc {
                    name: func.name.clone(),
                    kind: FlameFuncKind::Update,
                    agent: agent_name.to_owned(),
                    source_fn: func.name.clone(),
                    in_msg: None,
                    out_msg: None,
                    uses_rng,
                    added_agent,
                    layer: 0,
                });
            }
        }

        model.assign_layers();
        model
    }

    pub fn message(&self, name: &str) -> Option<&FlameMessage> {
        self.messages.iter().find(|msg| msg.name == name)
    }

    /// Layer assignment: a topological sort over publish→consume edges plus
    /// the simulate order, with each function placed one layer after its
    /// deepest predecessor.
    fn assign_layers(&mut self) {
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..self.funcs.len()).map(|i| graph.add_node(i)).collect();

        for (pub_idx, publisher) in self.funcs.iter().enumerate() {
            let Some(msg) = &publisher.out_msg else {
                continue;
            };
            for (con_idx, consumer) in self.funcs.iter().enumerate() {
                if consumer.in_msg.as_deref() == Some(msg.as_str()) {
                    graph.add_edge(nodes[pub_idx], nodes[con_idx], ());
                }
            }
        }

        // Step functions run in simulate order; chain the derived functions
        // of consecutive steps.
        for pair in self.funcs.windows(2).enumerate() {
            let (index, window) = pair;
            if window[0].source_fn != window[1].source_fn {
                graph.add_edge(nodes[index], nodes[index + 1], ());
            }
        }

        let Ok(order) = toposort(&graph, None) else {
            // The construction above cannot introduce cycles; keep the
            // declaration order if it ever does.
            for (index, func) in self.funcs.iter_mut().enumerate() {
                func.layer = index;
            }
            self.layer_count = self.funcs.len();
            return;
        };

        let mut layers = vec![0usize; self.funcs.len()];
        for node in order {
            let func_idx = graph[node];
            let depth = graph
                .neighbors_directed(node, petgraph::Direction::Incoming)
                .map(|pred| layers[graph[pred]] + 1)
                .max()
                .unwrap_or(0);
            layers[func_idx] = depth;
        }

        self.layer_count = layers.iter().max().map(|max| max + 1).unwrap_or(0);
        for (func, layer) in self.funcs.iter_mut().zip(layers) {
            func.layer = layer;
        }
        self.funcs.sort_by_key(|func| func.layer);
    }
}

/// Message payload: the position member plus every member the consumer
/// reads, in agent declaration order.
fn message_members(
    agent: &AgentDeclaration,
    read: &std::collections::BTreeSet<String>,
) -> Vec<(String, Type)> {
    agent
        .members
        .iter()
        .filter(|member| member.is_position || read.contains(&member.name))
        .map(|member| (member.name.clone(), member.resolved.clone()))
        .collect()
}

/// Unpack members to scalar `(name, c_type)` pairs: vectors split into
/// `_x`/`_y`(/`_z`) components.
pub fn unpack_members(members: &[(String, Type)], use_float: bool) -> Vec<(String, String)> {
    let float_ty = if use_float { "float" } else { "double" };
    let mut out = vec![];
    for (name, ty) in members {
        match ty {
            Type::Bool | Type::Int32 => out.push((name.clone(), "int".to_owned())),
            Type::Float32 => out.push((name.clone(), float_ty.to_owned())),
            Type::Vec2 => {
                out.push((format!("{name}_x"), float_ty.to_owned()));
                out.push((format!("{name}_y"), float_ty.to_owned()));
            }
            Type::Vec3 => {
                out.push((format!("{name}_x"), float_ty.to_owned()));
                out.push((format!("{name}_y"), float_ty.to_owned()));
                out.push((format!("{name}_z"), float_ty.to_owned()));
            }
            _ => {}
        }
    }
    out
}

/// Unpacked members of an agent declaration.
pub fn unpack_agent_members(agent: &AgentDeclaration, use_float: bool) -> Vec<(String, String)> {
    let members: Vec<_> = agent
        .members
        .iter()
        .map(|member| (member.name.clone(), member.resolved.clone()))
        .collect();
    unpack_members(&members, use_float)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{
        analyze, register_builtin_functions, BuiltinFunctions, ErrorStream, Params,
    };
    use crate::lexer::Lexer;
    use crate::parser;

    fn model_for(source: &str) -> FlameModel {
        let tokens = Lexer::new(source).lex().expect("should lex");
        let mut script = parser::parse(tokens).expect("should parse");

        let mut builtins = BuiltinFunctions::default();
        register_builtin_functions(&mut builtins);
        let mut errors = ErrorStream::default();
        analyze(&mut script, &builtins, &Params::default(), &mut errors);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);

        FlameModel::from_script(&script)
    }

    const SOURCE: &str = "environment { max: [10, 10], granularity: 1 }\n\
        agent Bird { position vec2 pos; vec2 velocity; }\n\
        step flock(Bird b in, Bird b2 out) {\n\
          vec2 avg = [0.0, 0.0];\n\
          for (Bird other : near(b, 2.0)) {\n\
            avg += other.velocity;\n\
          }\n\
          b2.velocity = avg;\n\
        }\n\
        step drift(Bird b in, Bird b2 out) {\n\
          b2.pos = b.pos + b.velocity;\n\
        }\n\
        simulate 10 { flock, drift }";

    #[test]
    fn test_near_step_is_split() {
        let model = model_for(SOURCE);
        let names: Vec<_> = model.funcs.iter().map(|func| func.name.as_str()).collect();
        assert_eq!(names, vec!["flock_publish", "flock", "drift"]);

        let publish = &model.funcs[0];
        assert_eq!(publish.kind, FlameFuncKind::Publish);
        assert_eq!(publish.out_msg.as_deref(), Some("flock_message"));
        let update = &model.funcs[1];
        assert_eq!(update.in_msg.as_deref(), Some("flock_message"));
    }

    #[test]
    fn test_publish_precedes_consume() {
        let model = model_for(SOURCE);
        for publisher in &model.funcs {
            let Some(msg) = &publisher.out_msg else {
                continue;
            };
            for consumer in &model.funcs {
                if consumer.in_msg.as_deref() == Some(msg.as_str()) {
                    assert!(
                        publisher.layer < consumer.layer,
                        "{} must run before {}",
                        publisher.name,
                        consumer.name
                    );
                }
            }
        }
    }

    #[test]
    fn test_simulate_order_is_kept() {
        let model = model_for(SOURCE);
        let flock = model.funcs.iter().find(|f| f.name == "flock").unwrap();
        let drift = model.funcs.iter().find(|f| f.name == "drift").unwrap();
        assert!(flock.layer < drift.layer);
    }

    #[test]
    fn test_message_carries_read_members_and_position() {
        let model = model_for(SOURCE);
        let msg = model.message("flock_message").expect("message");
        let names: Vec<_> = msg.members.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["pos", "velocity"]);
    }

    #[test]
    fn test_unpack_members_splits_vectors() {
        let members = vec![
            ("pos".to_owned(), Type::Vec2),
            ("energy".to_owned(), Type::Int32),
        ];
        assert_eq!(
            unpack_members(&members, false),
            vec![
                ("pos_x".to_owned(), "double".to_owned()),
                ("pos_y".to_owned(), "double".to_owned()),
                ("energy".to_owned(), "int".to_owned()),
            ]
        );
    }
}
