//! 优先级队列：按优先级分组，组内严格 FIFO
//!
//! 与 Agent / Message 无关的通用结构，优先级只要求 `Ord + Copy`。优先级类别数量很少，
//! 因此 remove / change_priority 按组线性扫描即可，不会打乱无关元素的相对顺序。

use std::collections::{BTreeMap, VecDeque};

/// 优先级队列：值越大越先出队；同一优先级内先进先出
#[derive(Debug, Clone)]
pub struct PriorityQueue<T, P> {
    groups: BTreeMap<P, VecDeque<T>>,
    len: usize,
}

impl<T, P: Ord + Copy> Default for PriorityQueue<T, P> {
    fn default() -> Self {
        Self {
            groups: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<T: PartialEq, P: Ord + Copy> PriorityQueue<T, P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, item: T, priority: P) {
        self.groups.entry(priority).or_default().push_back(item);
        self.len += 1;
    }

    /// 放回所在优先级组的队首（出队后处理失败时使用）
    pub fn enqueue_front(&mut self, item: T, priority: P) {
        self.groups.entry(priority).or_default().push_front(item);
        self.len += 1;
    }

    /// 取出最高优先级组的队首；空队列返回 None（而不是错误）
    pub fn dequeue(&mut self) -> Option<T> {
        self.pop().map(|(item, _)| item)
    }

    /// 同 dequeue，连同所在优先级一起返回
    pub fn pop(&mut self) -> Option<(T, P)> {
        let (&priority, group) = self.groups.iter_mut().next_back()?;
        let item = group.pop_front();
        if group.is_empty() {
            self.groups.remove(&priority);
        }
        let item = item?;
        self.len -= 1;
        Some((item, priority))
    }

    pub fn peek(&self) -> Option<&T> {
        self.groups.values().next_back().and_then(|group| group.front())
    }

    pub fn peek_priority(&self) -> Option<P> {
        self.groups.keys().next_back().copied()
    }

    /// 删除第一个等于 item 的元素
    pub fn remove(&mut self, item: &T) -> bool {
        self.take(item).is_some()
    }

    /// 修改优先级：元素移到新优先级组的队尾（视为重新入队）
    pub fn change_priority(&mut self, item: &T, new_priority: P) -> bool {
        match self.take(item) {
            Some(owned) => {
                self.enqueue(owned, new_priority);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.groups.values().any(|group| group.contains(item))
    }

    pub fn priority_of(&self, item: &T) -> Option<P> {
        self.groups
            .iter()
            .find(|(_, group)| group.contains(item))
            .map(|(priority, _)| *priority)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.len = 0;
    }

    /// 按出队顺序遍历（不消费）
    pub fn iter(&self) -> impl Iterator<Item = (&T, P)> {
        self.groups
            .iter()
            .rev()
            .flat_map(|(priority, group)| group.iter().map(move |item| (item, *priority)))
    }

    fn take(&mut self, item: &T) -> Option<T> {
        let mut emptied = None;
        let mut found = None;
        for (priority, group) in self.groups.iter_mut() {
            if let Some(pos) = group.iter().position(|x| x == item) {
                found = group.remove(pos);
                if group.is_empty() {
                    emptied = Some(*priority);
                }
                break;
            }
        }
        if let Some(priority) = emptied {
            self.groups.remove(&priority);
        }
        if found.is_some() {
            self.len -= 1;
        }
        found
    }
}
