//! 阶段依赖图分析
//!
//! 邻接表 + 入度表。依赖环用迭代 DFS（三色标记）找出并报告；
//! 关键路径在拓扑序上做最长链 DP，只覆盖无环部分（环上及其下游的阶段不参与）。

use std::collections::HashMap;

use serde::Serialize;

use crate::plan::types::PhasePlan;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanAnalysis {
    /// 最长依赖链上的阶段 id（从最早依赖到最终阶段）
    pub critical_path: Vec<String>,
    pub critical_path_length: usize,
    /// 关键路径上的加权工时
    pub critical_path_hours: u32,
    /// 每个环以其中字典序最小的 id 开头
    pub cycles: Vec<Vec<String>>,
    pub root_phases: Vec<String>,
    pub leaf_phases: Vec<String>,
    /// 关键路径的边数
    pub max_depth: usize,
}

impl PlanAnalysis {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

/// 依赖图（按计划中的阶段顺序编号）
pub struct PhaseGraph<'a> {
    plan: &'a PhasePlan,
    /// 阶段下标 -> 它依赖的阶段下标
    depends_on: Vec<Vec<usize>>,
    /// 阶段下标 -> 依赖它的阶段下标
    dependents: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

impl<'a> PhaseGraph<'a> {
    pub fn new(plan: &'a PhasePlan) -> Self {
        let index: HashMap<&str, usize> = plan
            .phases
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.as_str(), i))
            .collect();
        let n = plan.phases.len();
        let mut depends_on = vec![Vec::new(); n];
        let mut dependents = vec![Vec::new(); n];
        for (i, phase) in plan.phases.iter().enumerate() {
            for dep in &phase.dependencies {
                // 悬空依赖在校验阶段已被拒绝，这里忽略
                if let Some(&j) = index.get(dep.as_str()) {
                    depends_on[i].push(j);
                    dependents[j].push(i);
                }
            }
        }
        Self {
            plan,
            depends_on,
            dependents,
        }
    }

    fn id(&self, i: usize) -> String {
        self.plan.phases[i].id.clone()
    }

    /// 迭代 DFS 找出所有回边对应的环
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let n = self.depends_on.len();
        let mut marks = vec![Mark::White; n];
        let mut cycles: Vec<Vec<String>> = Vec::new();

        for start in 0..n {
            if marks[start] != Mark::White {
                continue;
            }
            // (节点, 下一个待访问的邻居下标)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::Gray;

            while let Some(top) = stack.last_mut() {
                let (node, next) = *top;
                if let Some(&child) = self.depends_on[node].get(next) {
                    top.1 += 1;
                    match marks[child] {
                        Mark::White => {
                            marks[child] = Mark::Gray;
                            stack.push((child, 0));
                        }
                        Mark::Gray => {
                            let pos = stack.iter().position(|(v, _)| *v == child).unwrap_or(0);
                            let cycle: Vec<String> = stack[pos..].iter().map(|(v, _)| self.id(*v)).collect();
                            let cycle = normalize_cycle(cycle);
                            if !cycles.contains(&cycle) {
                                cycles.push(cycle);
                            }
                        }
                        Mark::Black => {}
                    }
                } else {
                    marks[node] = Mark::Black;
                    stack.pop();
                }
            }
        }
        cycles
    }

    /// Kahn 拓扑序；环上及其下游的节点不会出现
    fn topological_order(&self) -> Vec<usize> {
        let n = self.depends_on.len();
        let mut in_degree: Vec<usize> = self.depends_on.iter().map(|d| d.len()).collect();
        let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        ready.reverse();
        let mut order = Vec::with_capacity(n);
        while let Some(v) = ready.pop() {
            order.push(v);
            for &w in self.dependents[v].iter().rev() {
                in_degree[w] -= 1;
                if in_degree[w] == 0 {
                    ready.push(w);
                }
            }
        }
        order
    }

    /// 最长依赖链（按阶段数），并列时取计划中靠前的终点
    pub fn critical_path(&self) -> Vec<String> {
        let order = self.topological_order();
        let n = self.depends_on.len();
        let mut length = vec![0usize; n];
        let mut prev: Vec<Option<usize>> = vec![None; n];
        let mut in_order = vec![false; n];
        for &v in &order {
            in_order[v] = true;
        }

        for &v in &order {
            length[v] = 1;
            for &d in &self.depends_on[v] {
                if in_order[d] && length[d] + 1 > length[v] {
                    length[v] = length[d] + 1;
                    prev[v] = Some(d);
                }
            }
        }

        let Some(end) = (0..n)
            .filter(|&v| in_order[v])
            .fold(None, |best: Option<usize>, v| match best {
                Some(b) if length[b] >= length[v] => Some(b),
                _ => Some(v),
            })
        else {
            return Vec::new();
        };

        let mut path = vec![end];
        let mut cur = end;
        while let Some(p) = prev[cur] {
            path.push(p);
            cur = p;
        }
        path.reverse();
        path.into_iter().map(|i| self.id(i)).collect()
    }

    pub fn analyze(&self) -> PlanAnalysis {
        let critical_path = self.critical_path();
        let critical_path_hours = critical_path
            .iter()
            .filter_map(|id| self.plan.phase(id))
            .map(|p| p.complexity.weight_hours())
            .sum();
        let n = self.depends_on.len();
        PlanAnalysis {
            critical_path_length: critical_path.len(),
            max_depth: critical_path.len().saturating_sub(1),
            critical_path_hours,
            cycles: self.find_cycles(),
            root_phases: (0..n)
                .filter(|&i| self.depends_on[i].is_empty())
                .map(|i| self.id(i))
                .collect(),
            leaf_phases: (0..n)
                .filter(|&i| self.dependents[i].is_empty())
                .map(|i| self.id(i))
                .collect(),
            critical_path,
        }
    }
}

/// 旋转到最小 id 开头，便于去重
fn normalize_cycle(mut cycle: Vec<String>) -> Vec<String> {
    if let Some(min_pos) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    {
        cycle.rotate_left(min_pos);
    }
    cycle
}

/// 便捷入口
pub fn analyze_plan(plan: &PhasePlan) -> PlanAnalysis {
    let analysis = PhaseGraph::new(plan).analyze();
    if analysis.has_cycles() {
        tracing::warn!(cycles = analysis.cycles.len(), "plan dependency graph contains cycles");
    }
    analysis
}
